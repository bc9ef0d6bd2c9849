//! Tenant/billing backend contract (consumed, not implemented, by the gate).

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use accessgate_core::TenantId;

use crate::{FeatureFlagSet, ResourceType, SubscriptionRecord};

/// Current usage per resource type.
pub type ResourceCounts = HashMap<ResourceType, u64>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Transport failure; the data may exist but we could not get it.
    #[error("billing backend unreachable: {0}")]
    Network(String),

    /// The backend has no subscription for this tenant.
    #[error("no subscription for tenant {0}")]
    NotFound(TenantId),

    /// The backend answered with a payload we cannot interpret.
    #[error("malformed billing payload: {0}")]
    Malformed(String),
}

impl BackendError {
    /// The backend answered, but its answer is unusable. These are logged and
    /// settle fail-closed rather than surfacing as fetch errors.
    pub fn is_data_error(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Malformed(_))
    }
}

/// External tenant/billing backend.
#[async_trait]
pub trait BillingBackend: Send + Sync {
    async fn subscription_status(&self, tenant_id: TenantId) -> Result<SubscriptionRecord, BackendError>;

    async fn feature_flags(&self, tenant_id: TenantId) -> Result<FeatureFlagSet, BackendError>;

    async fn resource_counts(&self, tenant_id: TenantId) -> Result<ResourceCounts, BackendError>;
}
