//! Identity provider contract (consumed, not implemented, by the gate).

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{SessionChange, SessionSnapshot};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The provider could not be reached; the session state is unknown.
    #[error("identity provider unreachable: {0}")]
    Network(String),

    /// The provider did not answer within the configured bound.
    #[error("identity provider did not answer within {0:?}")]
    Timeout(Duration),

    /// The provider rejected the session (invalid, revoked, expired).
    #[error("invalid session: {0}")]
    InvalidSession(String),
}

impl IdentityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

/// A subscription to session-change notifications.
///
/// Changes arrive in emission order. Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct SessionChanges {
    receiver: mpsc::UnboundedReceiver<SessionChange>,
}

impl SessionChanges {
    pub fn new(receiver: mpsc::UnboundedReceiver<SessionChange>) -> Self {
        Self { receiver }
    }

    /// Wait for the next change. `None` once the provider is gone.
    pub async fn recv(&mut self) -> Option<SessionChange> {
        self.receiver.recv().await
    }

    /// Take a change if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionChange> {
        self.receiver.try_recv().ok()
    }
}

/// External identity provider.
///
/// Implementations must stamp every emitted [`SessionChange`] and every
/// [`SessionSnapshot`] with the same monotonic sequence so a consumer can merge
/// both paths by recency.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Register for session-change notifications.
    fn subscribe(&self) -> SessionChanges;

    /// Look up the session the provider currently holds.
    async fn current_session(&self) -> Result<SessionSnapshot, IdentityError>;

    /// End the session remotely.
    async fn sign_out(&self) -> Result<(), IdentityError>;
}
