//! Route/region guard: turns gate decisions into exactly one view state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use accessgate_billing::{Feature, ResourceType};

use crate::decision::{AccessRequest, AuthorizationDecision, DecisionReason};
use crate::explain::explain;
use crate::AuthorizationGate;

/// How a blocked region is presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationMode {
    /// Render an inline notice in place of the content.
    #[default]
    Alert,
    /// Render the notice and navigate away.
    Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardOptions {
    pub required_feature: Option<Feature>,
    pub required_resource: Option<ResourceType>,
    pub redirect_path: String,
    /// `None` uses the gate's configured default.
    pub bypass_admin: Option<bool>,
    pub presentation: PresentationMode,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            required_feature: None,
            required_resource: None,
            redirect_path: "/".to_string(),
            bypass_admin: None,
            presentation: PresentationMode::Alert,
        }
    }
}

impl GuardOptions {
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
        self.bypass_admin = Some(bypass);
        self
    }

    pub fn redirect_to(mut self, path: impl Into<String>) -> Self {
        self.redirect_path = path.into();
        self.presentation = PresentationMode::Redirect;
        self
    }

    fn request(&self, default_bypass: bool) -> AccessRequest {
        AccessRequest {
            required_feature: self.required_feature,
            required_resource: self.required_resource,
            bypass_admin: self.bypass_admin.unwrap_or(default_bypass),
        }
    }
}

/// What a blocked region shows instead of its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedNotice {
    pub reason: DecisionReason,
    pub required_feature: Option<Feature>,
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    /// Offer a retry action (see [`RouteGuard::retry`]).
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GuardView {
    Loading,
    Blocked(BlockedNotice),
    Content,
}

impl GuardView {
    fn from_decision(decision: &AuthorizationDecision, request: &AccessRequest) -> Self {
        if decision.is_loading {
            return GuardView::Loading;
        }
        if decision.is_authorized {
            return GuardView::Content;
        }
        let e = explain(decision, request);
        GuardView::Blocked(BlockedNotice {
            reason: e.reason,
            required_feature: decision.required_feature,
            title: e.title,
            message: e.message,
            suggestions: e.suggestions,
            retryable: e.retryable,
        })
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, GuardView::Blocked(_))
    }
}

/// Navigation side effect used by redirect-mode guards.
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);
}

/// Navigator that records every requested path.
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    visits: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, path: &str) {
        self.visits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_string());
    }
}

/// State shared between a guard and its watcher task.
struct Shared {
    options: GuardOptions,
    request: AccessRequest,
    navigator: Arc<dyn Navigator>,
    view: watch::Sender<GuardView>,
    /// Revoked when the guard is dropped. Checked under `last` before every commit.
    alive: AtomicBool,
    last: Mutex<Option<AuthorizationDecision>>,
}

impl Shared {
    fn last(&self) -> MutexGuard<'_, Option<AuthorizationDecision>> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commit a decision. No-op once the guard is gone or if nothing changed.
    fn apply(&self, decision: AuthorizationDecision) {
        let mut last = self.last();
        if !self.alive.load(Ordering::SeqCst) || last.as_ref() == Some(&decision) {
            return;
        }
        *last = Some(decision);

        let view = GuardView::from_decision(&decision, &self.request);
        debug!(reason = %decision.reason, loading = decision.is_loading, "guard view changed");

        if view.is_blocked() && self.options.presentation == PresentationMode::Redirect {
            info!(path = %self.options.redirect_path, reason = %decision.reason, "redirecting blocked viewer");
            self.navigator.navigate(&self.options.redirect_path);
        }
        self.view.send_replace(view);
    }
}

/// A protected region bound to one [`AuthorizationGate`].
///
/// The guard re-evaluates whenever the gate reports a change. Dropping it
/// stops all further view updates and navigation, but does not cancel any
/// subscription fetch it started.
pub struct RouteGuard {
    gate: Arc<AuthorizationGate>,
    shared: Arc<Shared>,
    watcher: JoinHandle<()>,
}

impl core::fmt::Debug for RouteGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RouteGuard")
            .field("options", &self.shared.options)
            .field("view", &*self.shared.view.borrow())
            .finish_non_exhaustive()
    }
}

impl RouteGuard {
    /// Evaluate once and start watching the gate.
    pub fn mount(gate: Arc<AuthorizationGate>, options: GuardOptions, navigator: Arc<dyn Navigator>) -> Self {
        let request = options.request(gate.config().bypass_admin_default);
        let (view, _rx) = watch::channel(GuardView::Loading);
        let shared = Arc::new(Shared {
            options,
            request,
            navigator,
            view,
            alive: AtomicBool::new(true),
            last: Mutex::new(None),
        });

        // Subscribe before the first evaluation so no change is missed.
        let mut changes = gate.changes();
        shared.apply(gate.current(&request));

        let watcher = {
            let gate = Arc::clone(&gate);
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while changes.changed().await {
                    shared.apply(gate.current(&shared.request));
                }
            })
        };

        Self { gate, shared, watcher }
    }

    /// The committed view.
    pub fn view(&self) -> GuardView {
        self.shared.view.borrow().clone()
    }

    pub fn request(&self) -> &AccessRequest {
        &self.shared.request
    }

    /// Read-only handle onto the committed view. It stops changing once the
    /// guard is dropped.
    pub fn observer(&self) -> GuardObserver {
        GuardObserver {
            view: self.shared.view.subscribe(),
        }
    }

    /// Recover from a transient failure: re-run a failed session lookup,
    /// otherwise refetch the tenant's subscription.
    pub fn retry(&self) {
        let sessions = self.gate.sessions();
        if sessions.state().error.is_some() {
            info!("guard retry requested; re-running session lookup");
            sessions.refresh();
        } else if let Some(tenant) = self.gate.tenant() {
            info!(tenant_id = %tenant.tenant_id(), "guard retry requested");
            self.gate.invalidate_tenant(tenant.tenant_id());
        }
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        {
            let _last = self.shared.last();
            self.shared.alive.store(false, Ordering::SeqCst);
        }
        self.watcher.abort();
    }
}

/// Watches a guard's committed view.
#[derive(Debug, Clone)]
pub struct GuardObserver {
    view: watch::Receiver<GuardView>,
}

impl GuardObserver {
    pub fn current(&self) -> GuardView {
        self.view.borrow().clone()
    }

    /// Wait until the view satisfies `pred`. `None` if the guard is gone first.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&GuardView) -> bool) -> Option<GuardView> {
        self.view.wait_for(|v| pred(v)).await.ok().map(|v| v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_to_switches_presentation() {
        let options = GuardOptions::new().feature(Feature::Leads).redirect_to("/billing");
        assert_eq!(options.presentation, PresentationMode::Redirect);
        assert_eq!(options.redirect_path, "/billing");
    }

    #[test]
    fn explicit_bypass_overrides_default() {
        let options = GuardOptions::new();
        assert!(options.request(true).bypass_admin);
        assert!(!options.clone().bypass_admin(false).request(true).bypass_admin);
    }

    #[test]
    fn blocked_view_carries_notice() {
        let request = AccessRequest::new().feature(Feature::Reports);
        let view = GuardView::from_decision(&AuthorizationDecision::feature_disabled(Feature::Reports), &request);
        let GuardView::Blocked(notice) = view else {
            panic!("expected blocked view");
        };
        assert_eq!(notice.reason, DecisionReason::FeatureDisabled);
        assert_eq!(notice.required_feature, Some(Feature::Reports));
        assert!(!notice.retryable);

        assert_eq!(
            GuardView::from_decision(&AuthorizationDecision::LOADING, &request),
            GuardView::Loading
        );
        assert_eq!(
            GuardView::from_decision(&AuthorizationDecision::authorized(), &request),
            GuardView::Content
        );
    }

    #[test]
    fn view_serializes_with_state_tag() {
        let json = serde_json::to_value(GuardView::Loading).unwrap();
        assert_eq!(json["state"], "loading");
    }

    #[test]
    fn recording_navigator_keeps_order() {
        let nav = RecordingNavigator::new();
        nav.navigate("/a");
        nav.navigate("/b");
        assert_eq!(nav.visits(), vec!["/a", "/b"]);
    }
}
