use serde::Serialize;

use crate::{Feature, FeatureFlagSet, ResourceType, SubscriptionRecord};

/// Derived access facts for one tenant and one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Entitlements {
    pub is_active: bool,
    pub is_over_limit: bool,
    pub has_feature: bool,
}

impl Entitlements {
    /// Fail-closed result for inconsistent inputs.
    pub const DENIED: Entitlements = Entitlements {
        is_active: false,
        is_over_limit: true,
        has_feature: false,
    };
}

/// Evaluate entitlements for a request.
///
/// - No IO
/// - No panics
/// - Unknown or missing flags are `false`; with no feature requested,
///   `has_feature` is vacuously `true`
/// - `is_over_limit` is only computed for the requested resource
///
/// A record and flag set that belong to different tenants deny everything.
pub fn evaluate(
    record: &SubscriptionRecord,
    flags: &FeatureFlagSet,
    required_feature: Option<Feature>,
    resource: Option<ResourceType>,
) -> Entitlements {
    if record.tenant_id != flags.tenant_id {
        return Entitlements::DENIED;
    }

    Entitlements {
        is_active: record.status.is_active(),
        is_over_limit: resource.is_some_and(|r| record.is_over_limit(r)),
        has_feature: required_feature.is_none_or(|f| flags.enabled(f)),
    }
}
