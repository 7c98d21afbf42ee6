//! Run input and the per-node annotations that travel alongside it.
//!
//! A [`Request`] is never mutated once created. Each dispatch cycle wraps the
//! current batch payload in a [`Dispatch`], which adds the active degradation
//! parameters and the per-level deadline.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::budget::DegradationParams;
use crate::envelope::NodeId;

/// Input to a run.
#[derive(Debug, Clone)]
pub struct Request {
    batches: Vec<Value>,
    deadline: Instant,
    budget_ceiling: u64,
}

impl Request {
    /// A run with a single dispatch cycle.
    pub fn single(payload: Value, timeout: Duration, budget_ceiling: u64) -> Self {
        Self::batched(vec![payload], timeout, budget_ceiling)
    }

    /// A run with one dispatch cycle per batch payload.
    pub fn batched(batches: Vec<Value>, timeout: Duration, budget_ceiling: u64) -> Self {
        Self {
            batches,
            deadline: Instant::now() + timeout,
            budget_ceiling,
        }
    }

    /// Replace the deadline with an absolute instant.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn batches(&self) -> &[Value] {
        &self.batches
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn budget_ceiling(&self) -> u64 {
        self.budget_ceiling
    }
}

/// Per-cycle annotation passed alongside the payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Annotation {
    /// Zero-based dispatch cycle.
    pub cycle: u32,
    /// Degradation in force for this cycle.
    pub degradation: DegradationParams,
    /// Units the orchestrator believed were left when the cycle started.
    pub budget_hint: u64,
}

/// What a node receives from its parent.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub payload: Arc<Value>,
    pub annotation: Arc<Annotation>,
    /// This node must hand back a result by this instant.
    pub deadline: Instant,
}

impl Dispatch {
    pub fn new(payload: Arc<Value>, annotation: Arc<Annotation>, deadline: Instant) -> Self {
        Self {
            payload,
            annotation,
            deadline,
        }
    }

    /// The dispatch handed to a child. Each level gets `margin` less time
    /// so a parent can still aggregate after timing its children out.
    pub fn for_child(&self, margin: Duration) -> Dispatch {
        let now = Instant::now();
        let deadline = self
            .deadline
            .checked_sub(margin)
            .filter(|d| *d > now)
            .unwrap_or(now);
        Dispatch {
            payload: Arc::clone(&self.payload),
            annotation: Arc::clone(&self.annotation),
            deadline,
        }
    }

    /// Deadline for escalation and retry work at this node: half a margin
    /// before the node's own deadline, which is when its parent stops
    /// waiting. The remainder is left for aggregation.
    pub fn decision_deadline(&self, margin: Duration) -> Instant {
        self.deadline.checked_sub(margin / 2).unwrap_or(self.deadline)
    }

    pub fn is_disabled(&self, node: &NodeId) -> bool {
        self.annotation.degradation.is_disabled(node)
    }
}

/// Everything a leaf collaborator is given for one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct LeafCall {
    pub node: NodeId,
    pub payload: Value,
    pub cycle: u32,
    pub degradation: DegradationParams,
    /// Advisory; leaves do not enforce it.
    pub budget_hint: u64,
    /// Greater than 1.0 on a re-run requested by `RetryWithHigherCost`.
    pub quality_boost: f64,
}

impl LeafCall {
    pub fn from_dispatch(node: &NodeId, dispatch: &Dispatch) -> Self {
        Self {
            node: node.clone(),
            payload: (*dispatch.payload).clone(),
            cycle: dispatch.annotation.cycle,
            degradation: dispatch.annotation.degradation.clone(),
            budget_hint: dispatch.annotation.budget_hint,
            quality_boost: 1.0,
        }
    }

    pub fn boosted(mut self, multiplier: f64) -> Self {
        self.quality_boost = multiplier;
        self
    }
}
