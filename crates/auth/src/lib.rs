//! `accessgate-auth`: identity session and tenant resolution.
//!
//! The identity provider is an external collaborator behind
//! [`IdentityProvider`]; this crate owns the client-side view of it.

pub mod in_memory;
pub mod provider;
pub mod roles;
pub mod session;
pub mod store;
pub mod tenant;

pub use in_memory::InMemoryIdentityProvider;
pub use provider::{IdentityError, IdentityProvider, SessionChanges};
pub use roles::Role;
pub use session::{
    Session, SessionChange, SessionEventKind, SessionSnapshot, SessionToken, SessionValidationError,
    TenantMembership, validate_session,
};
pub use store::{DEFAULT_LOOKUP_TIMEOUT, SessionState, SessionStore, SignOutWarning};
pub use tenant::{Tenant, TenantContext, TenantResolver};
