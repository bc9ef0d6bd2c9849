//! In-memory billing backend for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use accessgate_core::TenantId;

use crate::backend::{BackendError, BillingBackend, ResourceCounts};
use crate::{FeatureFlagSet, SubscriptionRecord};

#[derive(Debug, Clone)]
enum SubscriptionFixture {
    Record(SubscriptionRecord),
    Raw(serde_json::Value),
}

#[derive(Debug, Default)]
struct Fixtures {
    subscriptions: HashMap<TenantId, SubscriptionFixture>,
    flags: HashMap<TenantId, Vec<(String, bool)>>,
    counts: HashMap<TenantId, ResourceCounts>,
    failures: HashMap<TenantId, BackendError>,
    latency: Duration,
}

/// In-memory billing backend.
///
/// - Per-tenant fixtures (typed records or raw JSON payloads)
/// - Optional latency and per-tenant failure injection
/// - Counts `subscription_status` calls per tenant so tests can assert how
///   many network round trips a cache issued
#[derive(Debug, Default)]
pub struct InMemoryBillingBackend {
    fixtures: Mutex<Fixtures>,
    calls: Mutex<HashMap<TenantId, usize>>,
}

impl InMemoryBillingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn fixtures(&self) -> MutexGuard<'_, Fixtures> {
        self.fixtures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_subscription(&self, record: SubscriptionRecord) {
        self.fixtures()
            .subscriptions
            .insert(record.tenant_id, SubscriptionFixture::Record(record));
    }

    /// Serve a raw payload; it is decoded on every fetch.
    pub fn put_raw_subscription(&self, tenant_id: TenantId, payload: serde_json::Value) {
        self.fixtures()
            .subscriptions
            .insert(tenant_id, SubscriptionFixture::Raw(payload));
    }

    pub fn put_flags<I, S>(&self, tenant_id: TenantId, flags: I)
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        let flags = flags.into_iter().map(|(name, on)| (name.into(), on)).collect();
        self.fixtures().flags.insert(tenant_id, flags);
    }

    pub fn put_counts(&self, tenant_id: TenantId, counts: ResourceCounts) {
        self.fixtures().counts.insert(tenant_id, counts);
    }

    /// Fail every call for this tenant until [`recover`](Self::recover).
    pub fn fail(&self, tenant_id: TenantId, error: BackendError) {
        self.fixtures().failures.insert(tenant_id, error);
    }

    pub fn recover(&self, tenant_id: TenantId) {
        self.fixtures().failures.remove(&tenant_id);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.fixtures().latency = latency;
    }

    /// Number of subscription lookups issued for a tenant.
    pub fn subscription_calls(&self, tenant_id: TenantId) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .copied()
            .unwrap_or(0)
    }

    async fn simulate(&self, tenant_id: TenantId) -> Result<(), BackendError> {
        let (latency, failure) = {
            let fixtures = self.fixtures();
            (fixtures.latency, fixtures.failures.get(&tenant_id).cloned())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BillingBackend for InMemoryBillingBackend {
    async fn subscription_status(&self, tenant_id: TenantId) -> Result<SubscriptionRecord, BackendError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tenant_id)
            .or_insert(0) += 1;

        self.simulate(tenant_id).await?;

        let fixture = self.fixtures().subscriptions.get(&tenant_id).cloned();
        match fixture {
            Some(SubscriptionFixture::Record(record)) => Ok(record),
            Some(SubscriptionFixture::Raw(payload)) => SubscriptionRecord::decode(tenant_id, payload),
            None => Err(BackendError::NotFound(tenant_id)),
        }
    }

    async fn feature_flags(&self, tenant_id: TenantId) -> Result<FeatureFlagSet, BackendError> {
        self.simulate(tenant_id).await?;
        let raw = self.fixtures().flags.get(&tenant_id).cloned().unwrap_or_default();
        Ok(FeatureFlagSet::from_raw(tenant_id, raw))
    }

    async fn resource_counts(&self, tenant_id: TenantId) -> Result<ResourceCounts, BackendError> {
        self.simulate(tenant_id).await?;
        Ok(self.fixtures().counts.get(&tenant_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Feature, SubscriptionStatus};

    #[tokio::test]
    async fn serves_fixtures_and_counts_calls() {
        let backend = InMemoryBillingBackend::new();
        let tenant = TenantId::new();
        backend.put_subscription(SubscriptionRecord::new(tenant, SubscriptionStatus::Active));
        backend.put_flags(tenant, [("leads", true)]);

        let record = backend.subscription_status(tenant).await.unwrap();
        let flags = backend.feature_flags(tenant).await.unwrap();

        assert_eq!(record.status, SubscriptionStatus::Active);
        assert!(flags.enabled(Feature::Leads));
        assert_eq!(backend.subscription_calls(tenant), 1);
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_found() {
        let backend = InMemoryBillingBackend::new();
        let tenant = TenantId::new();
        assert_eq!(
            backend.subscription_status(tenant).await,
            Err(BackendError::NotFound(tenant))
        );
    }

    #[tokio::test]
    async fn injected_failure_until_recovered() {
        let backend = InMemoryBillingBackend::new();
        let tenant = TenantId::new();
        backend.put_subscription(SubscriptionRecord::new(tenant, SubscriptionStatus::Active));
        backend.fail(tenant, BackendError::Network("reset".into()));

        assert!(backend.subscription_status(tenant).await.is_err());
        assert!(backend.resource_counts(tenant).await.is_err());

        backend.recover(tenant);
        assert!(backend.subscription_status(tenant).await.is_ok());
        assert_eq!(backend.subscription_calls(tenant), 2);
    }
}
