//! `accessgate-gate`: one authorization decision for protected regions.
//!
//! Dependency order is `Session → Tenant → Subscription/Flags → Decision →
//! Guard`:
//!
//! - [`decide`] is the pure core (no IO, no panics).
//! - [`AuthorizationGate`] gathers its inputs from the session store and the
//!   subscription cache.
//! - [`RouteGuard`] renders the decision as exactly one [`GuardView`].

pub mod config;
pub mod decision;
pub mod explain;
pub mod gate;
pub mod guard;

pub use config::GateConfig;
pub use decision::{AccessRequest, AuthorizationDecision, DecisionInputs, DecisionReason, decide};
pub use explain::{AuthorizationExplanation, explain};
pub use gate::{AuthorizationGate, GateChanges};
pub use guard::{
    BlockedNotice, GuardObserver, GuardOptions, GuardView, Navigator, PresentationMode, RecordingNavigator,
    RouteGuard,
};
