// ─────────────────────────────────────────────────────────────────────────────
// Authorization Explanation (Audit Trail)
// ─────────────────────────────────────────────────────────────────────────────

use serde::Serialize;

use accessgate_billing::Feature;

use crate::{AccessRequest, AuthorizationDecision, DecisionReason};

/// Detailed explanation of an authorization decision.
///
/// Answers "why was this region shown or blocked?" in terms a viewer (or a
/// support engineer reading the audit log) can act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationExplanation {
    /// Whether the authorization was granted.
    pub granted: bool,

    /// Still waiting for data; nothing is decided yet.
    pub pending: bool,

    pub reason: DecisionReason,

    /// Short heading for a blocked notice.
    pub title: String,

    /// Human-readable reason for the decision.
    pub message: String,

    /// If denied, what the viewer can do about it.
    pub suggestions: Vec<String>,

    /// Trying again may succeed without anything else changing.
    pub retryable: bool,

    pub request: AccessRequest,
    pub admin_bypass: bool,
}

/// Explain a decision made for `request`.
pub fn explain(decision: &AuthorizationDecision, request: &AccessRequest) -> AuthorizationExplanation {
    let (title, message, suggestions) = describe(decision, request);

    AuthorizationExplanation {
        granted: decision.is_authorized,
        pending: decision.is_loading,
        reason: decision.reason,
        title: title.to_string(),
        message,
        suggestions,
        retryable: decision.reason == DecisionReason::TransientError,
        request: *request,
        admin_bypass: decision.admin_bypass,
    }
}

fn describe(decision: &AuthorizationDecision, request: &AccessRequest) -> (&'static str, String, Vec<String>) {
    if decision.is_loading {
        return ("Loading", "Checking your access".to_string(), vec![]);
    }
    if decision.is_authorized {
        let message = if decision.admin_bypass {
            "Granted through the tenant administrator bypass".to_string()
        } else {
            "Subscription and feature requirements are met".to_string()
        };
        return ("Access granted", message, vec![]);
    }

    match decision.reason {
        DecisionReason::NoSession => (
            "Sign in required",
            "You need to be signed in to view this page".to_string(),
            vec!["Sign in again; your session may have expired".to_string()],
        ),
        DecisionReason::NoTenant => (
            "No company selected",
            "Your account is not linked to exactly one company".to_string(),
            vec![
                "Select the company you want to work in".to_string(),
                "Ask your company owner to invite you".to_string(),
            ],
        ),
        DecisionReason::SubscriptionInactive => (
            "Subscription inactive",
            "This company's subscription is not active".to_string(),
            vec![
                "Update the payment method on file".to_string(),
                "Reactivate the plan from the billing page".to_string(),
            ],
        ),
        DecisionReason::FeatureDisabled => {
            let feature = decision.required_feature.or(request.required_feature);
            (
                "Feature not included",
                match feature {
                    Some(f) => format!("The '{f}' feature is not enabled on this plan"),
                    None => "This feature is not enabled on this plan".to_string(),
                },
                upgrade_suggestions(feature),
            )
        }
        DecisionReason::ResourceLimitReached => (
            "Plan limit reached",
            match request.required_resource {
                Some(r) => format!("This company has used all of its '{r}' allowance"),
                None => "This company has reached a plan limit".to_string(),
            },
            vec![
                "Upgrade to a plan with a higher limit".to_string(),
                "Archive or remove records you no longer need".to_string(),
            ],
        ),
        DecisionReason::TransientError => (
            "Temporarily unavailable",
            "We could not confirm your access right now".to_string(),
            vec!["Try again in a moment".to_string()],
        ),
        DecisionReason::None => (
            "Access denied",
            "Access was denied".to_string(),
            vec![],
        ),
    }
}

fn upgrade_suggestions(feature: Option<Feature>) -> Vec<String> {
    let mut suggestions = vec!["Upgrade to a plan that includes this feature".to_string()];
    if let Some(f) = feature {
        suggestions.insert(0, format!("Ask your company administrator to enable '{f}'"));
    }
    suggestions
}
