//! Leaf Executor: wraps one external collaborator.
//!
//! The executor invokes its collaborator exactly once per call, converts a
//! collaborator error into `Failed(reason)` with a single ERROR entry, and
//! raises a low-confidence escalation instead of guessing. Retries belong to
//! the caller.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::{LogEntry, NodeId, ResourceCost, ResultEnvelope};
use crate::escalation::{EscalationReason, EscalationRequest};
use crate::request::LeafCall;

/// Successful collaborator output.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub value: Value,
    /// Quality signal in [0, 1]; its business meaning belongs to the collaborator.
    pub confidence: f64,
    pub units_consumed: u64,
    /// Set when the collaborator itself cannot choose, e.g. its internal
    /// detectors disagree. Low confidence takes precedence.
    pub escalate: Option<EscalationReason>,
}

impl Invocation {
    pub fn new(value: Value, confidence: f64, units_consumed: u64) -> Self {
        Self {
            value,
            confidence,
            units_consumed,
            escalate: None,
        }
    }

    pub fn with_escalation(mut self, reason: EscalationReason) -> Self {
        self.escalate = Some(reason);
        self
    }
}

/// Failure reported by a collaborator. Units spent before failing still count.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
    pub units_consumed: u64,
}

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            units_consumed: 0,
        }
    }

    pub fn with_units(mut self, units: u64) -> Self {
        self.units_consumed = units;
        self
    }
}

/// The external operation a leaf performs (file read, model run, network call).
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn invoke(&self, call: &LeafCall) -> Result<Invocation, CollaboratorError>;

    /// Collaborator name for logging.
    fn name(&self) -> &str;
}

pub struct LeafExecutor {
    node: NodeId,
    collaborator: Arc<dyn Collaborator>,
    confidence_threshold: f64,
}

impl LeafExecutor {
    pub fn new(node: NodeId, collaborator: Arc<dyn Collaborator>, confidence_threshold: f64) -> Self {
        Self {
            node,
            collaborator,
            confidence_threshold,
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    pub fn collaborator_name(&self) -> &str {
        self.collaborator.name()
    }

    /// Invoke the collaborator once and wrap the outcome.
    pub async fn execute(&self, call: &LeafCall) -> ResultEnvelope {
        match self.collaborator.invoke(call).await {
            Ok(invocation) => self.wrap_success(call, invocation),
            Err(err) => {
                warn!(
                    node = %self.node,
                    collaborator = self.collaborator.name(),
                    error = %err,
                    "Collaborator failed"
                );
                ResultEnvelope::failed(
                    &self.node,
                    err.message.clone(),
                    ResourceCost::new(err.units_consumed),
                )
                .with_log(LogEntry::error(
                    &self.node,
                    format!("{} failed: {}", self.collaborator.name(), err),
                ))
            }
        }
    }

    fn wrap_success(&self, call: &LeafCall, invocation: Invocation) -> ResultEnvelope {
        let Invocation {
            value,
            confidence,
            units_consumed,
            escalate,
        } = invocation;
        let cost = ResourceCost::new(units_consumed);
        let mut envelope = ResultEnvelope::healthy(&self.node, value, cost)
            .with_log(LogEntry::debug(
                &self.node,
                format!(
                    "invoked {} (cycle {}, budget hint {}, boost {:.2})",
                    self.collaborator.name(),
                    call.cycle,
                    call.budget_hint,
                    call.quality_boost
                ),
            ))
            .with_log(LogEntry::info(
                &self.node,
                format!(
                    "{} completed: confidence {:.2}, {} units",
                    self.collaborator.name(),
                    confidence,
                    cost.units_consumed
                ),
            ));

        // NaN confidence escalates too
        if !(confidence >= self.confidence_threshold) {
            debug!(
                node = %self.node,
                confidence,
                threshold = self.confidence_threshold,
                "Confidence below local threshold"
            );
            envelope = envelope
                .with_log(LogEntry::warn(
                    &self.node,
                    format!(
                        "confidence {:.2} below threshold {:.2}; escalating",
                        confidence, self.confidence_threshold
                    ),
                ))
                .with_escalation(EscalationRequest::low_confidence(
                    &self.node,
                    confidence,
                    self.confidence_threshold,
                ));
        } else if let Some(reason) = escalate {
            debug!(node = %self.node, reason = %reason, "Collaborator requested escalation");
            envelope = envelope
                .with_log(LogEntry::warn(
                    &self.node,
                    format!("{} cannot choose ({}); escalating", self.collaborator.name(), reason),
                ))
                .with_escalation(EscalationRequest::raised(&self.node, reason, confidence));
        }
        envelope
    }
}

impl std::fmt::Debug for LeafExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafExecutor")
            .field("node", &self.node)
            .field("collaborator", &self.collaborator.name())
            .field("confidence_threshold", &self.confidence_threshold)
            .finish()
    }
}
