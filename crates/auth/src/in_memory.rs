//! In-memory identity provider for tests/dev.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::provider::{IdentityError, IdentityProvider, SessionChanges};
use crate::{Session, SessionChange, SessionEventKind, SessionSnapshot};

#[derive(Debug, Default)]
struct ProviderState {
    seq: u64,
    session: Option<Session>,
    subscribers: Vec<mpsc::UnboundedSender<SessionChange>>,
    lookup_delay: Duration,
    lookup_error: Option<IdentityError>,
    sign_out_error: Option<IdentityError>,
}

/// In-memory identity provider.
///
/// - Best-effort fan-out to every live subscriber
/// - Snapshots are taken when `current_session` is *called*, then returned
///   after the configured delay, so a slow lookup hands back older data than
///   the events emitted meanwhile
#[derive(Debug, Default)]
pub struct InMemoryIdentityProvider {
    state: Mutex<ProviderState>,
    lookups: AtomicUsize,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing session (as if restored from storage).
    pub fn with_session(session: Session) -> Self {
        let provider = Self::new();
        provider.lock().session = Some(session);
        provider
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay every `current_session` response.
    pub fn set_lookup_delay(&self, delay: Duration) {
        self.lock().lookup_delay = delay;
    }

    /// Make `current_session` fail (or succeed again with `None`).
    pub fn set_lookup_error(&self, error: Option<IdentityError>) {
        self.lock().lookup_error = error;
    }

    /// Make the remote half of `sign_out` fail.
    pub fn set_sign_out_error(&self, error: Option<IdentityError>) {
        self.lock().sign_out_error = error;
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    pub fn sign_in(&self, session: Session) -> u64 {
        self.emit(SessionEventKind::SignedIn, Some(session))
    }

    pub fn refresh(&self, session: Session) -> u64 {
        self.emit(SessionEventKind::TokenRefreshed, Some(session))
    }

    /// Provider-side expiry (e.g. the refresh token was revoked).
    pub fn expire(&self) -> u64 {
        self.emit(SessionEventKind::Expired, None)
    }

    fn emit(&self, kind: SessionEventKind, session: Option<Session>) -> u64 {
        let mut state = self.lock();
        state.seq += 1;
        state.session = session.clone();

        let change = SessionChange {
            seq: state.seq,
            kind,
            session,
        };

        // Drop any dead subscribers while publishing.
        state.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
        state.seq
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    fn subscribe(&self) -> SessionChanges {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        SessionChanges::new(rx)
    }

    async fn current_session(&self) -> Result<SessionSnapshot, IdentityError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let (delay, result) = {
            let state = self.lock();
            let result = match &state.lookup_error {
                Some(err) => Err(err.clone()),
                None => Ok(SessionSnapshot {
                    seq: state.seq,
                    session: state.session.clone(),
                }),
            };
            (state.lookup_delay, result)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        if let Some(err) = self.lock().sign_out_error.clone() {
            return Err(err);
        }
        self.emit(SessionEventKind::SignedOut, None);
        Ok(())
    }
}
