//! Per-node escalation policy, held as plain function references.
//!
//! A policy answers two questions: may this node decide the request at all
//! (`can_decide_locally`), and if so what does it choose (`resolve`). Both are
//! pure functions supplied at tree construction.

use std::collections::HashSet;
use std::sync::Arc;

use super::types::{Choice, Decision, EscalationReason, EscalationRequest};

/// Whether a request is within a node's scope.
pub type Predicate = Arc<dyn Fn(&EscalationRequest) -> bool + Send + Sync>;

/// Produce a decision, or `None` when the node has no rule for it.
pub type Resolver = Arc<dyn Fn(&EscalationRequest) -> Option<Decision> + Send + Sync>;

#[derive(Clone)]
pub struct EscalationPolicy {
    pub can_decide_locally: Predicate,
    pub resolve: Resolver,
}

impl EscalationPolicy {
    pub fn new(can_decide_locally: Predicate, resolve: Resolver) -> Self {
        Self {
            can_decide_locally,
            resolve,
        }
    }

    /// Never decides; every request is forwarded.
    pub fn forward_all() -> Self {
        Self::new(Arc::new(|_| false), accept_default())
    }

    /// Decides everything with `resolve`.
    pub fn decide_all(resolve: Resolver) -> Self {
        Self::new(Arc::new(|_| true), resolve)
    }

    /// Decides only requests whose reason is in `reasons`.
    pub fn local_reasons(reasons: Vec<EscalationReason>, resolve: Resolver) -> Self {
        let reasons: HashSet<EscalationReason> = reasons.into_iter().collect();
        Self::new(
            Arc::new(move |request| reasons.contains(&request.reason)),
            resolve,
        )
    }

    pub fn can_decide(&self, request: &EscalationRequest) -> bool {
        (self.can_decide_locally)(request)
    }

    pub fn decide(&self, request: &EscalationRequest) -> Option<Decision> {
        (self.resolve)(request)
    }
}

impl std::fmt::Debug for EscalationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationPolicy").finish_non_exhaustive()
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::forward_all()
    }
}

/// Always pick the request's default choice.
pub fn accept_default() -> Resolver {
    Arc::new(|request| Some(Decision::default_for(request)))
}

/// Always pick `choice` when offered, otherwise the default.
pub fn always(choice: Choice) -> Resolver {
    Arc::new(move |request| {
        if request.offers(choice) {
            Some(Decision::choose(choice))
        } else {
            Some(Decision::default_for(request))
        }
    })
}

/// Flag for review below `floor`, accept the default otherwise.
///
/// Requests without a confidence in their context get the default.
pub fn confidence_floor(floor: f64) -> Resolver {
    Arc::new(move |request| {
        let below = request.confidence().map(|c| c < floor).unwrap_or(false);
        if below && request.offers(Choice::FlagForReview) {
            Some(
                Decision::choose(Choice::FlagForReview)
                    .with_conditions(serde_json::json!({ "review_floor": floor })),
            )
        } else {
            Some(Decision::default_for(request))
        }
    })
}

/// A resolver with no rules. At the root this is a configuration defect.
pub fn unresolved() -> Resolver {
    Arc::new(|_| None)
}
