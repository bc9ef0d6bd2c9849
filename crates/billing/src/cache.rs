//! Per-tenant subscription/flag cache with TTL, request coalescing and
//! stale-while-revalidate.
//!
//! ## Write ordering
//!
//! Every slot carries an *epoch* drawn from one monotonic counter. A fetch
//! remembers the epoch that was current when it started; `invalidate` moves the
//! slot to a newer epoch. A fetch whose starting epoch precedes the slot's
//! current epoch never commits: it re-runs instead, so a slow response from
//! before a plan change cannot clobber the refreshed view, and there is still
//! only one fetch in flight for the tenant.
//!
//! Fetches run in their own task. Callers that stop waiting do not cancel them;
//! the result still lands in the cache for everyone else.
//!
//! A failed fetch is not restarted by [`SubscriptionCache::ensure_fresh`] until
//! the tenant is invalidated or a TTL has passed since the failure;
//! [`SubscriptionCache::get`] always tries again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use accessgate_core::TenantId;

use crate::backend::BillingBackend;
use crate::TenantEntitlements;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscription cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// How long a fetched entry is served without refetching.
    pub ttl: Duration,
    /// Upper bound for one fetch (all backend calls together).
    pub fetch_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("billing backend unreachable: {0}")]
    Network(String),

    #[error("billing fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("billing fetch was aborted before it settled")]
    Aborted,
}

/// What the cache knows about one tenant.
///
/// `entitlements()`, `is_loading()` and `error()` give the
/// `{record, loading, error}` view callers reason about.
#[derive(Debug, Clone)]
pub enum CacheSnapshot {
    /// Never requested.
    Empty,
    /// First fetch in flight; nothing to serve yet.
    Loading,
    /// Data to serve. `fresh` is false once the TTL lapsed or the tenant was
    /// invalidated; `error` holds the last refresh failure, if any.
    Ready {
        entitlements: Arc<TenantEntitlements>,
        fresh: bool,
        error: Option<FetchError>,
    },
    /// Fetch failed and there is no earlier data to fall back on.
    Failed(FetchError),
}

impl CacheSnapshot {
    pub fn entitlements(&self) -> Option<&Arc<TenantEntitlements>> {
        match self {
            CacheSnapshot::Ready { entitlements, .. } => Some(entitlements),
            _ => None,
        }
    }

    /// Nothing has settled yet for this tenant.
    pub fn is_loading(&self) -> bool {
        matches!(self, CacheSnapshot::Empty | CacheSnapshot::Loading)
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            CacheSnapshot::Ready { error, .. } => error.as_ref(),
            CacheSnapshot::Failed(error) => Some(error),
            _ => None,
        }
    }
}

type Outcome = Result<Arc<TenantEntitlements>, FetchError>;

#[derive(Debug)]
struct Cached {
    value: Arc<TenantEntitlements>,
    stored_at: Instant,
    epoch: u64,
}

#[derive(Debug)]
struct Pending {
    id: u64,
    outcome: watch::Receiver<Option<Outcome>>,
}

#[derive(Debug)]
struct Failure {
    error: FetchError,
    epoch: u64,
    at: Instant,
}

#[derive(Debug)]
struct Slot {
    epoch: u64,
    cached: Option<Cached>,
    pending: Option<Pending>,
    last_error: Option<Failure>,
}

impl Slot {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            cached: None,
            pending: None,
            last_error: None,
        }
    }

    fn fresh_value(&self, now: Instant, ttl: Duration) -> Option<&Arc<TenantEntitlements>> {
        self.cached
            .as_ref()
            .filter(|c| c.epoch >= self.epoch && now.duration_since(c.stored_at) < ttl)
            .map(|c| &c.value)
    }

    /// Failed at the current epoch, recently enough not to retry on its own.
    fn backing_off(&self, now: Instant, ttl: Duration) -> bool {
        self.last_error
            .as_ref()
            .is_some_and(|f| f.epoch >= self.epoch && now.duration_since(f.at) < ttl)
    }

    fn snapshot(&self, now: Instant, ttl: Duration) -> CacheSnapshot {
        let error = self.last_error.as_ref().map(|f| f.error.clone());
        if let Some(cached) = &self.cached {
            return CacheSnapshot::Ready {
                entitlements: Arc::clone(&cached.value),
                fresh: self.fresh_value(now, ttl).is_some(),
                error,
            };
        }
        match (&self.pending, error) {
            (Some(_), _) => CacheSnapshot::Loading,
            (None, Some(err)) => CacheSnapshot::Failed(err),
            (None, None) => CacheSnapshot::Empty,
        }
    }
}

enum Lookup {
    Fresh(Arc<TenantEntitlements>),
    Wait(watch::Receiver<Option<Outcome>>),
    BackingOff,
}

enum Commit {
    Done(Outcome),
    /// Started before an invalidation; run again.
    Superseded,
    /// The slot was cleared or taken over; hand the result to our waiters only.
    Orphaned(Outcome),
}

struct Inner {
    backend: Arc<dyn BillingBackend>,
    config: CacheConfig,
    slots: Mutex<HashMap<TenantId, Slot>>,
    epochs: AtomicU64,
    revision: watch::Sender<u64>,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<TenantId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
    }

    fn current_epoch(&self, tenant_id: TenantId) -> Option<u64> {
        self.slots().get(&tenant_id).map(|s| s.epoch)
    }

    fn commit(
        &self,
        tenant_id: TenantId,
        fetch_id: u64,
        started_epoch: u64,
        result: Result<TenantEntitlements, FetchError>,
    ) -> Commit {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&tenant_id) else {
            return Commit::Orphaned(result.map(Arc::new));
        };
        if slot.pending.as_ref().map(|p| p.id) != Some(fetch_id) {
            return Commit::Orphaned(result.map(Arc::new));
        }
        if started_epoch < slot.epoch {
            return Commit::Superseded;
        }

        slot.pending = None;
        match result {
            Ok(mut entitlements) => {
                entitlements.subscription.fetched_at = Utc::now();
                let value = Arc::new(entitlements);
                slot.cached = Some(Cached {
                    value: Arc::clone(&value),
                    stored_at: Instant::now(),
                    epoch: started_epoch,
                });
                slot.last_error = None;
                Commit::Done(Ok(value))
            }
            Err(err) => {
                slot.last_error = Some(Failure {
                    error: err.clone(),
                    epoch: started_epoch,
                    at: Instant::now(),
                });
                Commit::Done(Err(err))
            }
        }
    }
}

/// Cache of [`TenantEntitlements`] keyed by tenant.
///
/// Cheap to clone; clones share the same entries. Must be used inside a Tokio
/// runtime (fetches are spawned).
#[derive(Clone)]
pub struct SubscriptionCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SubscriptionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCache")
            .field("config", &self.inner.config)
            .field("tenants", &self.inner.slots().len())
            .finish_non_exhaustive()
    }
}

impl SubscriptionCache {
    pub fn new(backend: Arc<dyn BillingBackend>, config: CacheConfig) -> Self {
        let (revision, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                slots: Mutex::new(HashMap::new()),
                epochs: AtomicU64::new(0),
                revision,
            }),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.config
    }

    /// Revision counter, bumped whenever any tenant's entry changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Current view without waiting or fetching.
    pub fn snapshot(&self, tenant_id: TenantId) -> CacheSnapshot {
        let now = Instant::now();
        match self.inner.slots().get(&tenant_id) {
            Some(slot) => slot.snapshot(now, self.inner.config.ttl),
            None => CacheSnapshot::Empty,
        }
    }

    /// Start a background fetch unless the entry is fresh, one is running, or
    /// the last attempt failed and nothing has changed since.
    pub fn ensure_fresh(&self, tenant_id: TenantId) {
        let _ = self.begin(tenant_id, false);
    }

    /// Fresh entitlements for a tenant, fetching (or joining a fetch) if needed.
    ///
    /// On failure the previous entry is served with the error attached; with
    /// no previous entry the result is [`CacheSnapshot::Failed`].
    pub async fn get(&self, tenant_id: TenantId) -> CacheSnapshot {
        let mut rx = match self.begin(tenant_id, true) {
            Lookup::Fresh(entitlements) => {
                return CacheSnapshot::Ready {
                    entitlements,
                    fresh: true,
                    error: None,
                };
            }
            Lookup::Wait(rx) => rx,
            Lookup::BackingOff => return self.snapshot(tenant_id),
        };

        let outcome: Outcome = match rx.wait_for(Option::is_some).await {
            Ok(settled) => (*settled).clone().unwrap_or(Err(FetchError::Aborted)),
            Err(_) => Err(FetchError::Aborted),
        };

        match outcome {
            Ok(entitlements) => CacheSnapshot::Ready {
                entitlements,
                fresh: true,
                error: None,
            },
            Err(err) => {
                let stale = self
                    .inner
                    .slots()
                    .get(&tenant_id)
                    .and_then(|s| s.cached.as_ref().map(|c| Arc::clone(&c.value)));
                match stale {
                    Some(entitlements) => {
                        debug!(tenant_id = %tenant_id, "serving stale entitlements after failed refresh: {err}");
                        CacheSnapshot::Ready {
                            entitlements,
                            fresh: false,
                            error: Some(err),
                        }
                    }
                    None => CacheSnapshot::Failed(err),
                }
            }
        }
    }

    /// Force the next `get` to refetch, even within the TTL.
    pub fn invalidate(&self, tenant_id: TenantId) {
        let invalidated = {
            let mut slots = self.inner.slots();
            match slots.get_mut(&tenant_id) {
                Some(slot) => {
                    slot.epoch = self.inner.next_epoch();
                    true
                }
                None => false,
            }
        };
        if invalidated {
            info!(tenant_id = %tenant_id, "subscription cache invalidated");
            self.inner.bump_revision();
        }
    }

    /// Forget everything about a tenant (e.g. its session ended).
    pub fn clear_tenant(&self, tenant_id: TenantId) {
        if self.inner.slots().remove(&tenant_id).is_some() {
            info!(tenant_id = %tenant_id, "subscription cache cleared");
            self.inner.bump_revision();
        }
    }

    fn begin(&self, tenant_id: TenantId, retry_failed: bool) -> Lookup {
        let now = Instant::now();
        let (fetch_id, tx, rx) = {
            let mut slots = self.inner.slots();
            let slot = slots
                .entry(tenant_id)
                .or_insert_with(|| Slot::new(self.inner.next_epoch()));

            if let Some(value) = slot.fresh_value(now, self.inner.config.ttl) {
                return Lookup::Fresh(Arc::clone(value));
            }
            if let Some(pending) = &slot.pending {
                debug!(tenant_id = %tenant_id, "joining in-flight subscription fetch");
                return Lookup::Wait(pending.outcome.clone());
            }
            if !retry_failed && slot.backing_off(now, self.inner.config.ttl) {
                return Lookup::BackingOff;
            }

            let fetch_id = self.inner.next_epoch();
            let (tx, rx) = watch::channel(None);
            slot.pending = Some(Pending {
                id: fetch_id,
                outcome: rx.clone(),
            });
            (fetch_id, tx, rx)
        };

        tokio::spawn(run_fetch(Arc::clone(&self.inner), tenant_id, fetch_id, tx));
        self.inner.bump_revision();
        Lookup::Wait(rx)
    }
}

async fn run_fetch(
    inner: Arc<Inner>,
    tenant_id: TenantId,
    fetch_id: u64,
    outcome: watch::Sender<Option<Outcome>>,
) {
    loop {
        let Some(started_epoch) = inner.current_epoch(tenant_id) else {
            outcome.send_replace(Some(Err(FetchError::Aborted)));
            return;
        };

        info!(tenant_id = %tenant_id, "fetching subscription and feature flags");
        let result = fetch_entitlements(inner.backend.as_ref(), tenant_id, inner.config.fetch_timeout).await;

        match inner.commit(tenant_id, fetch_id, started_epoch, result) {
            Commit::Done(result) => {
                match &result {
                    Ok(_) => info!(tenant_id = %tenant_id, "subscription cached"),
                    Err(err) => warn!(tenant_id = %tenant_id, "subscription fetch failed: {err}"),
                }
                outcome.send_replace(Some(result));
                inner.bump_revision();
                return;
            }
            Commit::Superseded => {
                debug!(tenant_id = %tenant_id, "discarding fetch that started before invalidation");
            }
            Commit::Orphaned(result) => {
                debug!(tenant_id = %tenant_id, "fetch settled after its entry was cleared");
                outcome.send_replace(Some(result));
                return;
            }
        }
    }
}

async fn fetch_entitlements(
    backend: &dyn BillingBackend,
    tenant_id: TenantId,
    timeout: Duration,
) -> Result<TenantEntitlements, FetchError> {
    let fetch = async {
        tokio::try_join!(
            backend.subscription_status(tenant_id),
            backend.feature_flags(tenant_id),
            backend.resource_counts(tenant_id),
        )
    };

    match tokio::time::timeout(timeout, fetch).await {
        Err(_) => Err(FetchError::Timeout(timeout)),
        Ok(Ok((mut subscription, flags, counts))) => {
            if subscription.tenant_id != tenant_id || flags.tenant_id != tenant_id {
                error!(tenant_id = %tenant_id, "billing backend answered for another tenant; failing closed");
                return Ok(TenantEntitlements::fail_closed(tenant_id));
            }
            subscription.merge_counts(counts);
            Ok(TenantEntitlements { subscription, flags })
        }
        Ok(Err(err)) if err.is_data_error() => {
            error!(tenant_id = %tenant_id, "unusable billing data, failing closed: {err}");
            Ok(TenantEntitlements::fail_closed(tenant_id))
        }
        Ok(Err(err)) => Err(FetchError::Network(err.to_string())),
    }
}
