//! `accessgate-billing`: subscription records, feature flags and the
//! per-tenant cache in front of the billing backend.
//!
//! - [`evaluate`] is pure: no IO, no panics.
//! - [`SubscriptionCache`] owns all IO and concurrency.

pub mod backend;
pub mod cache;
pub mod entitlement;
pub mod feature;
pub mod in_memory;
pub mod model;

pub use backend::{BackendError, BillingBackend, ResourceCounts};
pub use cache::{CacheConfig, CacheSnapshot, FetchError, SubscriptionCache};
pub use entitlement::{Entitlements, evaluate};
pub use feature::{Feature, ResourceType};
pub use in_memory::InMemoryBillingBackend;
pub use model::{FeatureFlagSet, Limit, SubscriptionRecord, SubscriptionStatus, TenantEntitlements};
