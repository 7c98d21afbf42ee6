//! Per-node, per-run execution phases with legal transition guards.
//!
//! ```text
//! Idle → Dispatching → AwaitingChildren → Aggregating → Done
//!                                            ↑   │
//!                                            │   ▼
//!                                       AwaitingDecision
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    Idle,
    Dispatching,
    AwaitingChildren,
    Aggregating,
    /// Blocked until the escalation router hands back a decision.
    AwaitingDecision,
    Done,
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Dispatching => write!(f, "Dispatching"),
            Self::AwaitingChildren => write!(f, "AwaitingChildren"),
            Self::Aggregating => write!(f, "Aggregating"),
            Self::AwaitingDecision => write!(f, "AwaitingDecision"),
            Self::Done => write!(f, "Done"),
        }
    }
}

fn is_legal_transition(from: NodePhase, to: NodePhase) -> bool {
    use NodePhase::*;
    matches!(
        (from, to),
        (Idle, Dispatching)
            | (Dispatching, AwaitingChildren)
            | (AwaitingChildren, Aggregating)
            | (Aggregating, AwaitingDecision)
            | (AwaitingDecision, Aggregating)
            | (Aggregating, Done)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub node: NodeId,
    pub from: NodePhase,
    pub to: NodePhase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Illegal phase transition at {}: {} → {}",
            self.node, self.from, self.to
        )
    }
}

impl std::error::Error for IllegalTransition {}

/// Phase tracker owned by one node's execution.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    node: NodeId,
    current: NodePhase,
    history: Vec<NodePhase>,
}

impl PhaseTracker {
    pub fn new(node: &NodeId) -> Self {
        Self {
            node: node.clone(),
            current: NodePhase::Idle,
            history: vec![NodePhase::Idle],
        }
    }

    pub fn current(&self) -> NodePhase {
        self.current
    }

    pub fn history(&self) -> &[NodePhase] {
        &self.history
    }

    pub fn advance(&mut self, to: NodePhase) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                node: self.node.clone(),
                from: self.current,
                to,
            });
        }
        tracing::trace!(node = %self.node, from = %self.current, to = %to, "Phase transition");
        self.current = to;
        self.history.push(to);
        Ok(())
    }

    /// Advance, reporting an illegal transition through tracing instead of failing.
    pub fn enter(&mut self, to: NodePhase) {
        if let Err(err) = self.advance(to) {
            tracing::error!("{}", err);
        }
    }
}
