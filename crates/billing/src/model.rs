//! Subscription and feature-flag records as cached per tenant.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use accessgate_core::TenantId;

use crate::backend::{BackendError, ResourceCounts};
use crate::{Feature, ResourceType};

/// Billing status reported by the billing processor.
///
/// Anything the processor sends that we do not recognise (or a missing value)
/// lands in `Unknown`, which is never active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Trialing | Self::Active)
    }
}

/// Quota for one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Bounded(u64),
    Unbounded,
}

impl Limit {
    /// Quota used when the plan does not mention a resource.
    pub fn missing() -> Self {
        Limit::Bounded(0)
    }

    pub fn is_exceeded_by(&self, count: u64) -> bool {
        match self {
            Limit::Bounded(max) => count > *max,
            Limit::Unbounded => false,
        }
    }
}

/// A tenant's subscription as last fetched from the billing backend.
///
/// Missing fields deserialize to their fail-closed defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub renewal_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_counters: HashMap<ResourceType, u64>,
    #[serde(default)]
    pub resource_limits: HashMap<ResourceType, Limit>,
    #[serde(default)]
    pub vendor_count: u64,
    #[serde(default = "Limit::missing")]
    pub vendor_limit: Limit,
    #[serde(default = "Utc::now")]
    pub fetched_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub fn new(tenant_id: TenantId, status: SubscriptionStatus) -> Self {
        Self {
            tenant_id,
            plan_id: None,
            status,
            renewal_date: None,
            resource_counters: HashMap::new(),
            resource_limits: HashMap::new(),
            vendor_count: 0,
            vendor_limit: Limit::missing(),
            fetched_at: Utc::now(),
        }
    }

    /// Record that denies everything: unknown status, no quota.
    pub fn fail_closed(tenant_id: TenantId) -> Self {
        Self::new(tenant_id, SubscriptionStatus::Unknown)
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn with_limit(mut self, resource: ResourceType, limit: Limit) -> Self {
        match resource {
            ResourceType::Vendors => self.vendor_limit = limit,
            other => {
                self.resource_limits.insert(other, limit);
            }
        }
        self
    }

    pub fn with_count(mut self, resource: ResourceType, count: u64) -> Self {
        self.set_count(resource, count);
        self
    }

    fn set_count(&mut self, resource: ResourceType, count: u64) {
        match resource {
            ResourceType::Vendors => self.vendor_count = count,
            other => {
                self.resource_counters.insert(other, count);
            }
        }
    }

    /// Decode a raw billing payload.
    ///
    /// Partially-missing payloads decode with fail-closed defaults; payloads
    /// that do not parse at all, or that name another tenant, are `Malformed`.
    pub fn decode(tenant_id: TenantId, payload: serde_json::Value) -> Result<Self, BackendError> {
        let record: SubscriptionRecord = serde_json::from_value(payload)
            .map_err(|e| BackendError::Malformed(format!("subscription payload: {e}")))?;
        if record.tenant_id != tenant_id {
            return Err(BackendError::Malformed(format!(
                "subscription payload is for tenant {} (expected {tenant_id})",
                record.tenant_id
            )));
        }
        Ok(record)
    }

    /// Fold freshly fetched usage counters into the record.
    pub fn merge_counts(&mut self, counts: ResourceCounts) {
        for (resource, count) in counts {
            self.set_count(resource, count);
        }
    }

    /// Current usage and quota for a resource.
    pub fn usage(&self, resource: ResourceType) -> (u64, Limit) {
        match resource {
            ResourceType::Vendors => (self.vendor_count, self.vendor_limit),
            other => (
                self.resource_counters.get(&other).copied().unwrap_or(0),
                self.resource_limits.get(&other).copied().unwrap_or_else(Limit::missing),
            ),
        }
    }

    pub fn is_over_limit(&self, resource: ResourceType) -> bool {
        let (count, limit) = self.usage(resource);
        limit.is_exceeded_by(count)
    }
}

/// Per-tenant feature switches.
///
/// Lookups for features that are absent return `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlagSet {
    pub tenant_id: TenantId,
    flags: BTreeMap<Feature, bool>,
}

impl FeatureFlagSet {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            flags: BTreeMap::new(),
        }
    }

    pub fn with(mut self, feature: Feature, enabled: bool) -> Self {
        self.flags.insert(feature, enabled);
        self
    }

    /// Build from backend flag names; unknown names are dropped with a warning.
    pub fn from_raw<I, S>(tenant_id: TenantId, raw: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: AsRef<str>,
    {
        let mut set = Self::new(tenant_id);
        for (name, enabled) in raw {
            match name.as_ref().parse::<Feature>() {
                Ok(feature) => {
                    set.flags.insert(feature, enabled);
                }
                Err(err) => warn!(tenant_id = %tenant_id, "ignoring feature flag: {err}"),
            }
        }
        set
    }

    pub fn enabled(&self, feature: Feature) -> bool {
        self.flags.get(&feature).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, bool)> + '_ {
        self.flags.iter().map(|(f, on)| (*f, *on))
    }
}

/// Subscription and flags for one tenant, fetched and cached together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantEntitlements {
    pub subscription: SubscriptionRecord,
    pub flags: FeatureFlagSet,
}

impl TenantEntitlements {
    pub fn fail_closed(tenant_id: TenantId) -> Self {
        Self {
            subscription: SubscriptionRecord::fail_closed(tenant_id),
            flags: FeatureFlagSet::new(tenant_id),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.subscription.tenant_id
    }
}
