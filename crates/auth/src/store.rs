//! Session store: the single owner of this client's identity session.
//!
//! Two paths feed the store: the provider's change notifications and
//! `current_session` lookups. The store subscribes *before* it queries, and
//! both paths merge by provider sequence number, so a slow lookup can never
//! overwrite a newer change event. A local sign-out fences both paths: until
//! the provider reports a new sign-in, nothing brings a session back.

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use accessgate_core::UserId;

use crate::provider::{IdentityError, IdentityProvider, SessionChanges};
use crate::{Session, SessionEventKind, validate_session};

/// Bound on a single `current_session` lookup unless configured otherwise.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Point-in-time view of the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// True until an authoritative answer (event or lookup) arrives.
    pub loading: bool,
    pub session: Option<Session>,
    /// Provider sequence of the last applied change.
    pub seq: u64,
    /// Transient lookup failure that left the session unknown.
    pub error: Option<IdentityError>,
}

impl SessionState {
    fn initial() -> Self {
        Self {
            loading: true,
            session: None,
            seq: 0,
            error: None,
        }
    }

    pub fn is_authenticated_at(&self, now: chrono::DateTime<Utc>) -> bool {
        !self.loading && self.session.as_ref().is_some_and(|s| s.is_live_at(now))
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.session.as_ref().map(|s| s.user_id)
    }

    /// No answer has settled the session yet, or the last lookup failed.
    fn is_unknown(&self) -> bool {
        self.loading || self.error.is_some()
    }
}

/// The remote half of a sign-out failed. Local state is already cleared.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("remote sign-out failed (local session already cleared): {0}")]
pub struct SignOutWarning(#[from] pub IdentityError);

/// State shared by the store and its background tasks.
struct Shared {
    state: watch::Sender<SessionState>,
    /// Set by a local sign-out, cleared by the next `SignedIn` event.
    /// Only read or written under the watch lock.
    signed_out: AtomicBool,
}

/// Owns the current session and publishes every change through a watch channel.
pub struct SessionStore {
    provider: Arc<dyn IdentityProvider>,
    shared: Arc<Shared>,
    lookup_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl core::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionStore")
            .field("state", &*self.shared.state.borrow())
            .field("lookup_timeout", &self.lookup_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Start tracking the provider's session with [`DEFAULT_LOOKUP_TIMEOUT`].
    ///
    /// Must be called inside a Tokio runtime. The store starts in the loading
    /// state; use [`SessionStore::settled`] to wait for the first answer.
    pub fn start(provider: Arc<dyn IdentityProvider>) -> Arc<Self> {
        Self::start_with_timeout(provider, DEFAULT_LOOKUP_TIMEOUT)
    }

    /// Like [`start`](Self::start), with a custom lookup bound. A lookup still
    /// unanswered after `lookup_timeout` settles as a transient failure.
    pub fn start_with_timeout(provider: Arc<dyn IdentityProvider>, lookup_timeout: Duration) -> Arc<Self> {
        let (tx, _rx) = watch::channel(SessionState::initial());
        let shared = Arc::new(Shared {
            state: tx,
            signed_out: AtomicBool::new(false),
        });

        // Order matters: register for changes first, query second.
        let changes = provider.subscribe();
        let listener = tokio::spawn(listen(Arc::clone(&shared), changes));
        let initial = tokio::spawn(lookup(Arc::clone(&provider), Arc::clone(&shared), lookup_timeout));

        Arc::new(Self {
            provider,
            shared,
            lookup_timeout,
            tasks: Mutex::new(vec![listener, initial]),
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.state.borrow().loading
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.state.borrow().is_authenticated_at(Utc::now())
    }

    pub fn session(&self) -> Option<Session> {
        self.shared.state.borrow().session.clone()
    }

    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    /// Receiver that observes every state change.
    pub fn changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the store is no longer loading, then return its state.
    pub async fn settled(&self) -> SessionState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|s| !s.loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Ask the provider again, e.g. after a transient lookup failure.
    ///
    /// A store stuck on a failed lookup goes back to loading until the new
    /// answer lands. The answer merges by sequence like every other.
    pub fn refresh(&self) {
        self.shared.state.send_if_modified(|s| {
            if s.error.is_none() {
                return false;
            }
            s.loading = true;
            s.error = None;
            true
        });
        info!("re-running session lookup");

        let task = tokio::spawn(lookup(
            Arc::clone(&self.provider),
            Arc::clone(&self.shared),
            self.lookup_timeout,
        ));
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Sign the viewer out.
    ///
    /// Local state is cleared first and unconditionally; a failing provider
    /// call is reported as a [`SignOutWarning`], never as a reason to keep the
    /// session. Answers already in flight cannot restore it.
    pub async fn sign_out(&self) -> Result<(), SignOutWarning> {
        self.shared.state.send_modify(|s| {
            self.shared.signed_out.store(true, Ordering::SeqCst);
            s.loading = false;
            s.session = None;
            s.error = None;
        });
        info!("session cleared locally");

        self.provider.sign_out().await.map_err(|err| {
            warn!("remote sign-out failed; continuing signed out: {err}");
            SignOutWarning(err)
        })
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Merge an authoritative answer into the state by provider sequence.
///
/// `kind` is `None` for lookup answers.
fn apply(shared: &Shared, seq: u64, session: Option<Session>, kind: Option<SessionEventKind>) {
    let now = Utc::now();
    shared.state.send_if_modified(|current| {
        if session.is_some() && shared.signed_out.load(Ordering::SeqCst) {
            if kind == Some(SessionEventKind::SignedIn) {
                shared.signed_out.store(false, Ordering::SeqCst);
            } else {
                debug!(seq, ?kind, "ignoring session answer after local sign-out");
                let was_loading = current.loading;
                current.loading = false;
                return was_loading;
            }
        }

        let newer = seq > current.seq || (seq == current.seq && current.is_unknown());
        if !newer {
            debug!(seq, current = current.seq, "ignoring session answer older than applied state");
            let was_loading = current.loading;
            current.loading = false;
            return was_loading;
        }

        let session = session.filter(|s| match validate_session(s, now) {
            Ok(()) => true,
            Err(err) => {
                warn!(user_id = %s.user_id, "dropping session from provider: {err}");
                false
            }
        });

        let next = SessionState {
            loading: false,
            session,
            seq,
            error: None,
        };
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

async fn lookup(provider: Arc<dyn IdentityProvider>, shared: Arc<Shared>, bound: Duration) {
    let answer = match tokio::time::timeout(bound, provider.current_session()).await {
        Ok(answer) => answer,
        Err(_) => Err(IdentityError::Timeout(bound)),
    };

    match answer {
        Ok(snapshot) => apply(&shared, snapshot.seq, snapshot.session, None),
        Err(err) => {
            if err.is_transient() {
                warn!("session lookup failed: {err}");
            } else {
                info!("provider rejected stored session: {err}");
            }
            shared.state.send_if_modified(|current| {
                // A change event may already have settled the store.
                if !current.loading {
                    return false;
                }
                current.loading = false;
                current.session = None;
                current.error = err.is_transient().then_some(err);
                true
            });
        }
    }
}

async fn listen(shared: Arc<Shared>, mut changes: SessionChanges) {
    // Re-arm the expiry timer whenever any path replaces the session.
    let mut observed = shared.state.subscribe();
    loop {
        let expires_in = observed
            .borrow_and_update()
            .session
            .as_ref()
            .map(|s| (s.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

        tokio::select! {
            change = changes.recv() => match change {
                Some(change) => {
                    debug!(seq = change.seq, kind = ?change.kind, "session change");
                    apply(&shared, change.seq, change.session, Some(change.kind));
                }
                None => {
                    debug!("identity provider closed the change stream");
                    break;
                }
            },
            _ = observed.changed() => {}
            _ = expiry(expires_in) => expire_locally(&shared.state),
        }
    }
}

async fn expiry(after: Option<Duration>) {
    match after {
        Some(after) => tokio::time::sleep(after).await,
        None => pending::<()>().await,
    }
}

/// Drop the session once its own `expires_at` passes (wall clock).
fn expire_locally(state: &watch::Sender<SessionState>) {
    let now = Utc::now();
    state.send_if_modified(|current| match &current.session {
        Some(s) if !s.is_live_at(now) => {
            warn!(user_id = %s.user_id, "session expired locally");
            current.session = None;
            true
        }
        _ => false,
    });
}
