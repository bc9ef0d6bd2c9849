//! The authorization decision and the pure function that derives it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use accessgate_auth::{SessionState, TenantContext};
use accessgate_billing::{CacheSnapshot, Feature, ResourceType, evaluate};

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Authorized, or still loading.
    None,
    NoSession,
    NoTenant,
    SubscriptionInactive,
    FeatureDisabled,
    ResourceLimitReached,
    TransientError,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NoSession => "no_session",
            Self::NoTenant => "no_tenant",
            Self::SubscriptionInactive => "subscription_inactive",
            Self::FeatureDisabled => "feature_disabled",
            Self::ResourceLimitReached => "resource_limit_reached",
            Self::TransientError => "transient_error",
        }
    }
}

impl core::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one authorization check. Recomputed, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthorizationDecision {
    pub is_authorized: bool,
    pub is_loading: bool,
    pub reason: DecisionReason,
    /// Set when the denial is `feature_disabled`.
    pub required_feature: Option<Feature>,
    /// The grant came from the tenant-admin carve-out.
    pub admin_bypass: bool,
}

impl AuthorizationDecision {
    pub const LOADING: AuthorizationDecision = AuthorizationDecision {
        is_authorized: false,
        is_loading: true,
        reason: DecisionReason::None,
        required_feature: None,
        admin_bypass: false,
    };

    pub fn authorized() -> Self {
        Self {
            is_authorized: true,
            is_loading: false,
            reason: DecisionReason::None,
            required_feature: None,
            admin_bypass: false,
        }
    }

    pub fn bypassed() -> Self {
        Self {
            admin_bypass: true,
            ..Self::authorized()
        }
    }

    pub fn denied(reason: DecisionReason) -> Self {
        Self {
            is_authorized: false,
            is_loading: false,
            reason,
            required_feature: None,
            admin_bypass: false,
        }
    }

    pub fn feature_disabled(feature: Feature) -> Self {
        Self {
            required_feature: Some(feature),
            ..Self::denied(DecisionReason::FeatureDisabled)
        }
    }

    /// Settled and not authorized.
    pub fn is_denied(&self) -> bool {
        !self.is_loading && !self.is_authorized
    }
}

/// What a protected region asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct AccessRequest {
    pub required_feature: Option<Feature>,
    pub required_resource: Option<ResourceType>,
    pub bypass_admin: bool,
}

impl AccessRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feature(mut self, feature: Feature) -> Self {
        self.required_feature = Some(feature);
        self
    }

    pub fn resource(mut self, resource: ResourceType) -> Self {
        self.required_resource = Some(resource);
        self
    }

    pub fn bypass_admin(mut self, bypass: bool) -> Self {
        self.bypass_admin = bypass;
        self
    }
}

/// Everything a decision reads, captured at one instant.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    pub session: &'a SessionState,
    pub tenant: Option<&'a TenantContext>,
    pub subscription: &'a CacheSnapshot,
    pub now: DateTime<Utc>,
}

/// Decide whether `request` is authorized.
///
/// - No IO
/// - No panics
/// - Same inputs, same decision
///
/// Checks run in dependency order (session, tenant, subscription) and the
/// first one that is unresolved or failing wins.
pub fn decide(inputs: &DecisionInputs<'_>, request: &AccessRequest) -> AuthorizationDecision {
    let session = inputs.session;
    if session.loading {
        return AuthorizationDecision::LOADING;
    }

    if !session.is_authenticated_at(inputs.now) {
        return match &session.error {
            Some(err) if err.is_transient() => AuthorizationDecision::denied(DecisionReason::TransientError),
            _ => AuthorizationDecision::denied(DecisionReason::NoSession),
        };
    }

    let Some(tenant) = inputs.tenant else {
        return AuthorizationDecision::denied(DecisionReason::NoTenant);
    };

    if inputs.subscription.is_loading() {
        return AuthorizationDecision::LOADING;
    }

    let entitlements = inputs
        .subscription
        .entitlements()
        .filter(|e| e.tenant_id() == tenant.tenant_id());

    if request.bypass_admin && tenant.is_admin() {
        // Quotas still bind admins; only status and feature checks are skipped.
        return match (request.required_resource, entitlements) {
            (None, _) => AuthorizationDecision::bypassed(),
            (Some(resource), Some(e)) if e.subscription.is_over_limit(resource) => {
                AuthorizationDecision::denied(DecisionReason::ResourceLimitReached)
            }
            (Some(_), Some(_)) => AuthorizationDecision::bypassed(),
            (Some(_), None) => AuthorizationDecision::denied(DecisionReason::TransientError),
        };
    }

    let Some(entitlements) = entitlements else {
        return AuthorizationDecision::denied(DecisionReason::TransientError);
    };

    let e = evaluate(
        &entitlements.subscription,
        &entitlements.flags,
        request.required_feature,
        request.required_resource,
    );

    if !e.is_active {
        return AuthorizationDecision::denied(DecisionReason::SubscriptionInactive);
    }
    if !e.has_feature {
        return match request.required_feature {
            Some(feature) => AuthorizationDecision::feature_disabled(feature),
            None => AuthorizationDecision::denied(DecisionReason::FeatureDisabled),
        };
    }
    if e.is_over_limit {
        return AuthorizationDecision::denied(DecisionReason::ResourceLimitReached);
    }

    AuthorizationDecision::authorized()
}
