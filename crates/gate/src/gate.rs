//! The authorization gate: session, tenant and subscription folded into one
//! decision.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use accessgate_auth::{SessionState, SessionStore, TenantContext, TenantResolver};
use accessgate_billing::{BillingBackend, CacheSnapshot, SubscriptionCache};
use accessgate_core::{TenantId, UserId};

use crate::decision::{AccessRequest, AuthorizationDecision, DecisionInputs, decide};
use crate::explain::{AuthorizationExplanation, explain};
use crate::GateConfig;

/// Combines the session store, tenant resolution and the subscription cache.
///
/// Dropping the gate stops its session janitor; the stores it was given keep
/// running for their other owners.
pub struct AuthorizationGate {
    sessions: Arc<SessionStore>,
    cache: SubscriptionCache,
    resolver: TenantResolver,
    config: GateConfig,
    janitor: JoinHandle<()>,
}

impl core::fmt::Debug for AuthorizationGate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthorizationGate")
            .field("sessions", &self.sessions)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AuthorizationGate {
    /// Build a gate with its own subscription cache.
    pub fn new(sessions: Arc<SessionStore>, backend: Arc<dyn BillingBackend>, config: GateConfig) -> Arc<Self> {
        let cache = SubscriptionCache::new(backend, config.cache);
        Self::with_cache(sessions, cache, config)
    }

    /// Build a gate over an existing cache (shared with other gates).
    ///
    /// Spawns the session janitor, so this must run inside a Tokio runtime.
    pub fn with_cache(sessions: Arc<SessionStore>, cache: SubscriptionCache, config: GateConfig) -> Arc<Self> {
        let janitor = tokio::spawn(janitor(sessions.changes(), cache.clone(), TenantResolver::new()));
        Arc::new(Self {
            sessions,
            cache,
            resolver: TenantResolver::new(),
            config,
            janitor,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn cache(&self) -> &SubscriptionCache {
        &self.cache
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// A request carrying the configured admin-bypass default.
    pub fn request(&self) -> AccessRequest {
        AccessRequest::new().bypass_admin(self.config.bypass_admin_default)
    }

    /// The viewer's tenant, if one is resolved right now.
    pub fn tenant(&self) -> Option<TenantContext> {
        self.resolver.resolve(&self.sessions.state())
    }

    /// Decide from what is known right now.
    ///
    /// Never waits. If the tenant's subscription is missing or stale a
    /// background fetch is started and the decision reports loading (or
    /// serves the stale entry) until it lands.
    pub fn current(&self, request: &AccessRequest) -> AuthorizationDecision {
        let session = self.sessions.state();
        let tenant = self.resolver.resolve(&session);
        let subscription = self.subscription_now(&session, tenant.as_ref());
        self.decide(&session, tenant.as_ref(), &subscription, request)
    }

    /// Wait for every dependency to settle, then decide.
    pub async fn authorize(&self, request: &AccessRequest) -> AuthorizationDecision {
        let session = self.sessions.settled().await;
        let tenant = self.resolver.resolve(&session);
        let subscription = match &tenant {
            Some(t) if session.is_authenticated_at(Utc::now()) => self.cache.get(t.tenant_id()).await,
            _ => CacheSnapshot::Empty,
        };
        self.decide(&session, tenant.as_ref(), &subscription, request)
    }

    /// [`current`](Self::current) plus its audit explanation.
    pub fn explain(&self, request: &AccessRequest) -> AuthorizationExplanation {
        explain(&self.current(request), request)
    }

    /// External hook: the tenant's plan or flags changed.
    pub fn invalidate_tenant(&self, tenant_id: TenantId) {
        self.cache.invalidate(tenant_id);
    }

    /// Fires whenever the session or any cached subscription changes.
    pub fn changes(&self) -> GateChanges {
        GateChanges {
            sessions: self.sessions.changes(),
            cache: self.cache.changes(),
        }
    }

    fn subscription_now(&self, session: &SessionState, tenant: Option<&TenantContext>) -> CacheSnapshot {
        match tenant {
            // No fetch is ever issued without a live session.
            Some(t) if session.is_authenticated_at(Utc::now()) => {
                self.cache.ensure_fresh(t.tenant_id());
                self.cache.snapshot(t.tenant_id())
            }
            _ => CacheSnapshot::Empty,
        }
    }

    fn decide(
        &self,
        session: &SessionState,
        tenant: Option<&TenantContext>,
        subscription: &CacheSnapshot,
        request: &AccessRequest,
    ) -> AuthorizationDecision {
        let decision = decide(
            &DecisionInputs {
                session,
                tenant,
                subscription,
                now: Utc::now(),
            },
            request,
        );
        debug!(
            tenant_id = ?tenant.map(TenantContext::tenant_id),
            reason = %decision.reason,
            authorized = decision.is_authorized,
            loading = decision.is_loading,
            "authorization decided"
        );
        decision
    }
}

impl Drop for AuthorizationGate {
    fn drop(&mut self) {
        self.janitor.abort();
    }
}

/// Change notifications for an [`AuthorizationGate`].
#[derive(Debug)]
pub struct GateChanges {
    sessions: watch::Receiver<SessionState>,
    cache: watch::Receiver<u64>,
}

impl GateChanges {
    /// Wait for the next change. Returns `false` once the sources are gone.
    pub async fn changed(&mut self) -> bool {
        tokio::select! {
            res = self.sessions.changed() => res.is_ok(),
            res = self.cache.changed() => res.is_ok(),
        }
    }
}

/// Drops cached tenant data once nobody signed in is looking at it.
async fn janitor(mut sessions: watch::Receiver<SessionState>, cache: SubscriptionCache, resolver: TenantResolver) {
    let mut last: Option<(UserId, TenantId)> = None;
    loop {
        let seen = {
            let state = sessions.borrow_and_update();
            if state.loading {
                last
            } else {
                let viewer = state.user_id();
                let tenant = resolver.resolve(&state).map(|t| t.tenant_id());
                viewer.zip(tenant)
            }
        };

        if let Some((user_id, tenant_id)) = last {
            if seen != last {
                info!(user_id = %user_id, tenant_id = %tenant_id, "viewer left tenant; clearing cached subscription");
                cache.clear_tenant(tenant_id);
            }
        }
        last = seen;

        if sessions.changed().await.is_err() {
            return;
        }
    }
}
