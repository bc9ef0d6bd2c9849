use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use accessgate_core::{TenantId, UserId};

use crate::Role;

/// Opaque bearer token issued by the identity provider.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SessionToken(***)")
    }
}

/// A viewer's membership in a tenant, as asserted by the identity provider.
///
/// Admin status comes from `roles` here and nowhere else; the client cannot
/// elevate itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMembership {
    pub tenant_id: TenantId,
    pub owner_user_id: UserId,
    pub roles: Vec<Role>,
}

impl TenantMembership {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(Role::is_admin)
    }
}

/// The live identity session of this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub token: SessionToken,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub memberships: Vec<TenantMembership>,
    /// Tenant the viewer last switched into, if the provider tracks one.
    #[serde(default)]
    pub active_tenant_id: Option<TenantId>,
}

impl Session {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        validate_session(self, now).is_ok()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionValidationError {
    #[error("session has expired")]
    Expired,

    #[error("session not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid session time window (expires_at <= issued_at)")]
    InvalidTimeWindow,
}

/// Deterministically validate a session's time window.
///
/// Token signature checks belong to the identity provider; this only looks at
/// the timestamps it handed us.
pub fn validate_session(session: &Session, now: DateTime<Utc>) -> Result<(), SessionValidationError> {
    if session.expires_at <= session.issued_at {
        return Err(SessionValidationError::InvalidTimeWindow);
    }
    if now < session.issued_at {
        return Err(SessionValidationError::NotYetValid);
    }
    if now >= session.expires_at {
        return Err(SessionValidationError::Expired);
    }
    Ok(())
}

/// What happened to the session, as reported by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    SignedIn,
    TokenRefreshed,
    SignedOut,
    Expired,
}

/// A session-change notification.
///
/// `seq` is assigned by the provider and increases monotonically across every
/// event it emits; it is the only ordering the session store trusts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    pub seq: u64,
    pub kind: SessionEventKind,
    pub session: Option<Session>,
}

/// Result of querying the provider for the current session.
///
/// `seq` is the sequence number of the latest event this snapshot reflects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub seq: u64,
    pub session: Option<Session>,
}
