//! Tenant resolution: session → exactly one tenant, or none.

use serde::{Deserialize, Serialize};

use accessgate_core::{TenantId, UserId};

use crate::{Role, SessionState, TenantMembership};

/// The customer organization a viewer is acting within.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: TenantId,
    pub owner_user_id: UserId,
}

/// Resolved tenant plus the viewer's standing inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant: Tenant,
    viewer: UserId,
    roles: Vec<Role>,
}

impl TenantContext {
    pub fn new(tenant: Tenant, viewer: UserId, roles: Vec<Role>) -> Self {
        Self { tenant, viewer, roles }
    }

    pub fn tenant(&self) -> Tenant {
        self.tenant
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant.tenant_id
    }

    pub fn viewer(&self) -> UserId {
        self.viewer
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Admin status as asserted by the identity provider's membership roles.
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(Role::is_admin)
    }
}

/// Derives the tenant from data the session already carries (no I/O).
#[derive(Debug, Default, Clone, Copy)]
pub struct TenantResolver;

impl TenantResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the viewer's tenant.
    ///
    /// `None` while the session is loading or absent, and whenever the choice
    /// would be ambiguous (no memberships, several memberships without an
    /// active-tenant hint, or a hint that matches no membership).
    pub fn resolve(&self, state: &SessionState) -> Option<TenantContext> {
        if state.loading {
            return None;
        }
        let session = state.session.as_ref()?;

        let membership: &TenantMembership = match session.active_tenant_id {
            Some(active) => session.memberships.iter().find(|m| m.tenant_id == active)?,
            None => match session.memberships.as_slice() {
                [only] => only,
                _ => return None,
            },
        };

        Some(TenantContext::new(
            Tenant {
                tenant_id: membership.tenant_id,
                owner_user_id: membership.owner_user_id,
            },
            session.user_id,
            membership.roles.clone(),
        ))
    }
}
