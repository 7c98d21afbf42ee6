//! Escalation requests, decisions and the audit trail they leave behind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::NodeId;

/// Options a node may be unable to choose among.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    /// Keep the originating node's own result.
    AcceptDefault,
    /// Run the originating leaf once more with a quality boost.
    RetryWithHigherCost,
    /// Keep the result but mark it for human review.
    FlagForReview,
}

impl std::fmt::Display for Choice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AcceptDefault => write!(f, "accept_default"),
            Self::RetryWithHigherCost => write!(f, "retry_with_higher_cost"),
            Self::FlagForReview => write!(f, "flag_for_review"),
        }
    }
}

/// Why a node escalated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Collaborator confidence below the leaf's local threshold
    LowConfidence,
    /// The collaborator's own sub-results disagree; raised through
    /// `Invocation::with_escalation`
    ConflictingResults,
    /// Anything else, named by the collaborator
    Explicit { reason: String },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowConfidence => write!(f, "low_confidence"),
            Self::ConflictingResults => write!(f, "conflicting_results"),
            Self::Explicit { reason } => write!(f, "explicit: {}", reason),
        }
    }
}

/// A decision a node declined to make on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub origin: NodeId,
    pub reason: EscalationReason,
    /// Opaque context, forwarded verbatim on every hop.
    pub context: Value,
    pub options: Vec<Choice>,
    pub default_choice: Choice,
}

impl EscalationRequest {
    pub fn new(
        origin: &NodeId,
        reason: EscalationReason,
        context: Value,
        options: Vec<Choice>,
        default_choice: Choice,
    ) -> Self {
        Self {
            origin: origin.clone(),
            reason,
            context,
            options,
            default_choice,
        }
    }

    /// The request a leaf raises when its collaborator is not confident enough.
    pub fn low_confidence(origin: &NodeId, confidence: f64, threshold: f64) -> Self {
        Self::with_leaf_options(
            origin,
            EscalationReason::LowConfidence,
            serde_json::json!({ "confidence": confidence, "threshold": threshold }),
        )
    }

    /// The request a leaf raises when its collaborator names its own reason.
    pub fn raised(origin: &NodeId, reason: EscalationReason, confidence: f64) -> Self {
        Self::with_leaf_options(origin, reason, serde_json::json!({ "confidence": confidence }))
    }

    fn with_leaf_options(origin: &NodeId, reason: EscalationReason, context: Value) -> Self {
        Self::new(
            origin,
            reason,
            context,
            vec![
                Choice::AcceptDefault,
                Choice::RetryWithHigherCost,
                Choice::FlagForReview,
            ],
            Choice::AcceptDefault,
        )
    }

    /// Confidence recorded in the context, if any.
    pub fn confidence(&self) -> Option<f64> {
        self.context.get("confidence").and_then(Value::as_f64)
    }

    pub fn offers(&self, choice: Choice) -> bool {
        self.options.contains(&choice)
    }
}

/// Outcome of an escalation, produced by exactly one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub chosen: Choice,
    #[serde(default)]
    pub conditions: Value,
}

impl Decision {
    pub fn choose(chosen: Choice) -> Self {
        Self {
            chosen,
            conditions: Value::Null,
        }
    }

    pub fn with_conditions(mut self, conditions: Value) -> Self {
        self.conditions = conditions;
        self
    }

    /// The decision used when an escalation is cancelled.
    pub fn default_for(request: &EscalationRequest) -> Self {
        Self::choose(request.default_choice)
    }
}

/// What a node did with an escalation passing through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopAction {
    Forwarded,
    Decided,
}

/// One step of an escalation climb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationHop {
    pub node: NodeId,
    pub action: HopAction,
}

/// Record of a resolved escalation, carried up to the run outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationAudit {
    pub origin: NodeId,
    pub reason: EscalationReason,
    pub hops: Vec<EscalationHop>,
    /// `None` when the escalation was cancelled by a timeout.
    pub decided_by: Option<NodeId>,
    pub chosen: Choice,
    #[serde(default)]
    pub cancelled_by_timeout: bool,
}

impl EscalationAudit {
    /// Number of forwards before a decision.
    pub fn forwards(&self) -> usize {
        self.hops
            .iter()
            .filter(|h| h.action == HopAction::Forwarded)
            .count()
    }

    /// Audit for an escalation cancelled by a deadline.
    pub fn cancelled(request: &EscalationRequest, hops: Vec<EscalationHop>) -> Self {
        Self {
            origin: request.origin.clone(),
            reason: request.reason.clone(),
            hops,
            decided_by: None,
            chosen: request.default_choice,
            cancelled_by_timeout: true,
        }
    }
}
