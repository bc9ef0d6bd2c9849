//! Black-box scenarios: identity provider → session store → gate → guard,
//! with in-memory providers standing in for the external services.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;

use accessgate_auth::{IdentityError, InMemoryIdentityProvider, Role, Session, SessionToken, TenantMembership};
use accessgate_billing::{
    BackendError, CacheSnapshot, Feature, InMemoryBillingBackend, Limit, ResourceType, SubscriptionRecord,
    SubscriptionStatus,
};
use accessgate_core::{TenantId, UserId};
use accessgate_gate::{
    AccessRequest, AuthorizationGate, DecisionReason, GateConfig, GuardOptions, GuardView, RecordingNavigator,
    RouteGuard,
};

const WAIT: Duration = Duration::from_secs(5);

fn session(user_id: UserId, tenant_id: TenantId, roles: Vec<Role>, ttl: chrono::Duration) -> Session {
    let now = Utc::now();
    Session {
        user_id,
        token: SessionToken::new("token"),
        issued_at: now - chrono::Duration::seconds(1),
        expires_at: now + ttl,
        memberships: vec![TenantMembership {
            tenant_id,
            owner_user_id: user_id,
            roles,
        }],
        active_tenant_id: None,
    }
}

struct World {
    identity: Arc<InMemoryIdentityProvider>,
    billing: Arc<InMemoryBillingBackend>,
    gate: Arc<AuthorizationGate>,
    tenant: TenantId,
}

impl World {
    fn signed_in(status: SubscriptionStatus, flags: &[(&str, bool)]) -> Self {
        Self::with_session(status, flags, vec![Role::new("salesperson")], chrono::Duration::hours(1))
    }

    fn with_session(
        status: SubscriptionStatus,
        flags: &[(&str, bool)],
        roles: Vec<Role>,
        ttl: chrono::Duration,
    ) -> Self {
        accessgate_observability::init_for_tests();

        let tenant = TenantId::new();
        let identity = Arc::new(InMemoryIdentityProvider::with_session(session(
            UserId::new(),
            tenant,
            roles,
            ttl,
        )));
        Self::build(identity, tenant, status, flags)
    }

    /// Signed in at the provider, which misbehaves from the first lookup.
    fn with_flaky_identity(flags: &[(&str, bool)], prepare: impl FnOnce(&InMemoryIdentityProvider)) -> Self {
        accessgate_observability::init_for_tests();

        let tenant = TenantId::new();
        let identity = Arc::new(InMemoryIdentityProvider::with_session(session(
            UserId::new(),
            tenant,
            vec![Role::new("salesperson")],
            chrono::Duration::hours(1),
        )));
        prepare(&identity);
        Self::build(identity, tenant, SubscriptionStatus::Active, flags)
    }

    fn signed_out(status: SubscriptionStatus) -> Self {
        accessgate_observability::init_for_tests();
        Self::build(Arc::new(InMemoryIdentityProvider::new()), TenantId::new(), status, &[])
    }

    fn build(
        identity: Arc<InMemoryIdentityProvider>,
        tenant: TenantId,
        status: SubscriptionStatus,
        flags: &[(&str, bool)],
    ) -> Self {
        let billing = Arc::new(InMemoryBillingBackend::new());
        billing.put_subscription(SubscriptionRecord::new(tenant, status).with_plan("growth"));
        billing.put_flags(tenant, flags.iter().copied());

        let config = GateConfig::default();
        let store = config.start_sessions(identity.clone());
        let gate = AuthorizationGate::new(store, billing.clone(), config);
        Self {
            identity,
            billing,
            gate,
            tenant,
        }
    }

    fn guard(&self, options: GuardOptions) -> (RouteGuard, Arc<RecordingNavigator>) {
        let navigator = Arc::new(RecordingNavigator::new());
        let guard = RouteGuard::mount(self.gate.clone(), options, navigator.clone());
        (guard, navigator)
    }

    fn fetches(&self) -> usize {
        self.billing.subscription_calls(self.tenant)
    }
}

async fn settled_view(guard: &RouteGuard) -> GuardView {
    let mut observer = guard.observer();
    tokio::time::timeout(WAIT, observer.wait_for(|v| *v != GuardView::Loading))
        .await
        .expect("guard never settled")
        .expect("guard dropped")
}

fn blocked_reason(view: &GuardView) -> Option<DecisionReason> {
    match view {
        GuardView::Blocked(notice) => Some(notice.reason),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn active_plan_with_enabled_feature_is_authorized() {
    let world = World::signed_in(SubscriptionStatus::Active, &[("leads", true)]);

    let decision = world.gate.authorize(&AccessRequest::new().feature(Feature::Leads)).await;
    assert!(decision.is_authorized);
    assert_eq!(decision.reason, DecisionReason::None);

    let (guard, _) = world.guard(GuardOptions::new().feature(Feature::Leads));
    assert_eq!(settled_view(&guard).await, GuardView::Content);
}

#[tokio::test(start_paused = true)]
async fn past_due_redirects_exactly_once() {
    let world = World::signed_in(SubscriptionStatus::PastDue, &[("leads", true)]);
    let (guard, navigator) = world.guard(GuardOptions::new().feature(Feature::Leads).redirect_to("/billing"));

    let view = settled_view(&guard).await;
    assert_eq!(blocked_reason(&view), Some(DecisionReason::SubscriptionInactive));
    assert_eq!(navigator.visits(), vec!["/billing"]);

    // Refetch with an unchanged answer: the guard re-evaluates but the
    // decision is the same, so there is no second navigation.
    world.gate.invalidate_tenant(world.tenant);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(world.fetches(), 2);
    assert!(guard.view().is_blocked());
    assert_eq!(navigator.visits().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn two_guards_for_one_tenant_share_one_fetch() {
    let world = World::signed_in(SubscriptionStatus::Active, &[("quotes", true), ("units", true)]);
    world.billing.set_latency(Duration::from_millis(100));

    let (quotes, _) = world.guard(GuardOptions::new().feature(Feature::Quotes));
    let (units, _) = world.guard(GuardOptions::new().feature(Feature::Units));

    assert_eq!(settled_view(&quotes).await, GuardView::Content);
    assert_eq!(settled_view(&units).await, GuardView::Content);
    assert_eq!(world.fetches(), 1);
}

#[tokio::test]
async fn expired_session_blocks_without_reload() {
    let world = World::with_session(
        SubscriptionStatus::Active,
        &[("sales", true)],
        vec![],
        chrono::Duration::milliseconds(1000),
    );
    let (guard, _) = world.guard(GuardOptions::new().feature(Feature::Sales));
    assert_eq!(settled_view(&guard).await, GuardView::Content);

    let mut observer = guard.observer();
    let view = tokio::time::timeout(WAIT, observer.wait_for(GuardView::is_blocked))
        .await
        .expect("session never expired")
        .expect("guard dropped");
    assert_eq!(blocked_reason(&view), Some(DecisionReason::NoSession));

    // The janitor dropped the tenant's cached subscription with the session.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(world.gate.cache().snapshot(world.tenant), CacheSnapshot::Empty));
}

#[tokio::test(start_paused = true)]
async fn network_failure_without_cache_offers_retry() {
    let world = World::signed_in(SubscriptionStatus::Active, &[("vendors", true)]);
    world
        .billing
        .fail(world.tenant, BackendError::Network("connection reset".into()));

    let (guard, _) = world.guard(GuardOptions::new().feature(Feature::Vendors));
    let view = settled_view(&guard).await;
    let GuardView::Blocked(notice) = &view else {
        panic!("expected a blocked view, got {view:?}");
    };
    assert_eq!(notice.reason, DecisionReason::TransientError);
    assert!(notice.retryable);

    // No retry storm while nothing changes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(world.fetches(), 1);

    world.billing.recover(world.tenant);
    guard.retry();

    let mut observer = guard.observer();
    let view = tokio::time::timeout(WAIT, observer.wait_for(|v| *v == GuardView::Content))
        .await
        .expect("retry never succeeded");
    assert_eq!(view, Some(GuardView::Content));
    assert_eq!(world.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn hung_identity_lookup_settles_as_transient_error() {
    let world = World::with_flaky_identity(&[("leads", true)], |identity| {
        identity.set_lookup_delay(Duration::from_secs(3600));
    });
    let request = AccessRequest::new().feature(Feature::Leads);

    let decision = tokio::time::timeout(Duration::from_secs(30), world.gate.authorize(&request))
        .await
        .expect("authorize never settled");
    assert!(!decision.is_loading);
    assert_eq!(decision.reason, DecisionReason::TransientError);
    assert_eq!(world.gate.current(&request).reason, DecisionReason::TransientError);
    assert_eq!(world.fetches(), 0);
}

#[tokio::test(start_paused = true)]
async fn guard_retry_reruns_failed_session_lookup() {
    let world = World::with_flaky_identity(&[("leads", true)], |identity| {
        identity.set_lookup_error(Some(IdentityError::Network("dns".into())));
    });

    let (guard, _) = world.guard(GuardOptions::new().feature(Feature::Leads));
    let view = settled_view(&guard).await;
    let GuardView::Blocked(notice) = &view else {
        panic!("expected a blocked view, got {view:?}");
    };
    assert_eq!(notice.reason, DecisionReason::TransientError);
    assert!(notice.retryable);

    world.identity.set_lookup_error(None);
    guard.retry();

    let mut observer = guard.observer();
    let view = tokio::time::timeout(WAIT, observer.wait_for(|v| *v == GuardView::Content))
        .await
        .expect("retry never restored the session");
    assert_eq!(view, Some(GuardView::Content));
    assert_eq!(world.identity.lookups(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn no_session_means_no_fetch() {
    let world = World::signed_out(SubscriptionStatus::Active);

    let decision = world.gate.authorize(&AccessRequest::new()).await;
    assert_eq!(decision.reason, DecisionReason::NoSession);
    assert!(!decision.is_loading);

    let (guard, _) = world.guard(GuardOptions::new());
    assert_eq!(blocked_reason(&settled_view(&guard).await), Some(DecisionReason::NoSession));
    assert_eq!(world.fetches(), 0);
}

#[tokio::test(start_paused = true)]
async fn active_plan_without_required_feature_is_authorized() {
    let world = World::signed_in(SubscriptionStatus::Trialing, &[]);
    let decision = world.gate.authorize(&AccessRequest::new()).await;
    assert!(decision.is_authorized);
    assert!(!decision.admin_bypass);
}

#[tokio::test(start_paused = true)]
async fn canceled_plan_denied_unless_admin_bypasses() {
    let world = World::with_session(
        SubscriptionStatus::Canceled,
        &[("reports", true)],
        vec![Role::ADMIN],
        chrono::Duration::hours(1),
    );
    let request = AccessRequest::new().feature(Feature::Reports);

    let denied = world.gate.authorize(&request).await;
    assert_eq!(denied.reason, DecisionReason::SubscriptionInactive);

    let bypassed = world.gate.authorize(&request.bypass_admin(true)).await;
    assert!(bypassed.is_authorized);
    assert!(bypassed.admin_bypass);
}

#[tokio::test(start_paused = true)]
async fn admin_bypass_does_not_lift_quotas() {
    let world = World::with_session(SubscriptionStatus::Canceled, &[], vec![Role::ADMIN], chrono::Duration::hours(1));
    world.billing.put_subscription(
        SubscriptionRecord::new(world.tenant, SubscriptionStatus::Canceled)
            .with_limit(ResourceType::Users, Limit::Bounded(2))
            .with_count(ResourceType::Users, 3),
    );

    let decision = world
        .gate
        .authorize(&AccessRequest::new().resource(ResourceType::Users).bypass_admin(true))
        .await;
    assert_eq!(decision.reason, DecisionReason::ResourceLimitReached);
}

#[tokio::test(start_paused = true)]
async fn concurrent_authorizations_share_one_fetch() {
    let world = World::signed_in(SubscriptionStatus::Active, &[("leads", true)]);
    world.billing.set_latency(Duration::from_millis(250));

    let mut set = JoinSet::new();
    for _ in 0..16 {
        let gate = world.gate.clone();
        set.spawn(async move { gate.authorize(&AccessRequest::new().feature(Feature::Leads)).await });
    }
    while let Some(decision) = set.join_next().await {
        assert!(decision.unwrap().is_authorized);
    }
    assert_eq!(world.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalidate_picks_up_plan_change() {
    let world = World::signed_in(SubscriptionStatus::Active, &[("export", false)]);
    let request = AccessRequest::new().feature(Feature::Export);

    assert_eq!(
        world.gate.authorize(&request).await.reason,
        DecisionReason::FeatureDisabled
    );

    world.billing.put_flags(world.tenant, [("export", true)]);
    // Still inside the TTL: served from cache.
    assert!(!world.gate.authorize(&request).await.is_authorized);
    assert_eq!(world.fetches(), 1);

    world.gate.invalidate_tenant(world.tenant);
    assert!(world.gate.authorize(&request).await.is_authorized);
    assert_eq!(world.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn dropped_guard_never_mutates_or_navigates() {
    let world = World::signed_in(SubscriptionStatus::PastDue, &[]);
    world.billing.set_latency(Duration::from_millis(100));

    let (guard, navigator) = world.guard(GuardOptions::new().redirect_to("/billing"));
    let observer = guard.observer();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(guard.view(), GuardView::Loading);
    drop(guard);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(navigator.visits().is_empty());
    assert_eq!(observer.current(), GuardView::Loading);

    // The fetch it started still landed for everyone else.
    assert!(matches!(
        world.gate.cache().snapshot(world.tenant),
        CacheSnapshot::Ready { fresh: true, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn sign_out_clears_tenant_cache() {
    let world = World::signed_in(SubscriptionStatus::Active, &[]);
    assert!(world.gate.authorize(&AccessRequest::new()).await.is_authorized);

    world.gate.sessions().sign_out().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(world.gate.cache().snapshot(world.tenant), CacheSnapshot::Empty));
    assert_eq!(
        world.gate.authorize(&AccessRequest::new()).await.reason,
        DecisionReason::NoSession
    );
}

#[tokio::test(start_paused = true)]
async fn provider_expiry_event_blocks_guard() {
    let world = World::signed_in(SubscriptionStatus::Active, &[]);
    let (guard, _) = world.guard(GuardOptions::new());
    assert_eq!(settled_view(&guard).await, GuardView::Content);

    world.identity.expire();

    let mut observer = guard.observer();
    let view = tokio::time::timeout(WAIT, observer.wait_for(GuardView::is_blocked))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blocked_reason(&view), Some(DecisionReason::NoSession));
}

#[tokio::test(start_paused = true)]
async fn explanation_matches_current_decision() {
    let world = World::signed_in(SubscriptionStatus::Active, &[]);
    let request = AccessRequest::new().feature(Feature::Reports);
    world.gate.authorize(&request).await;

    let explanation = world.gate.explain(&request);
    assert_eq!(explanation.reason, DecisionReason::FeatureDisabled);
    assert!(explanation.message.contains("reports"));
    assert!(!explanation.suggestions.is_empty());
}
