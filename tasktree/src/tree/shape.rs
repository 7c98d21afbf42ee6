//! Declarative tree shape and per-node specifications.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aggregate::{combine, Combiner};
use crate::envelope::{NodeId, ResourceCost};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::escalation::EscalationPolicy;
use crate::leaf::Collaborator;

/// Branching factor per level, root first. `[2, 2, 2]` is a three-level
/// binary tree with eight leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeShape {
    pub branching: Vec<u32>,
}

impl TreeShape {
    pub fn new(branching: Vec<u32>) -> Self {
        Self { branching }
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.branching.is_empty() {
            return Err(OrchestratorError::invalid_shape(
                "at least one level of children is required",
            ));
        }
        if let Some(level) = self.branching.iter().position(|b| *b == 0) {
            return Err(OrchestratorError::invalid_shape(format!(
                "branching factor at level {} is zero",
                level
            )));
        }
        Ok(())
    }

    /// Depth of the leaves (root is depth 0).
    pub fn depth(&self) -> usize {
        self.branching.len()
    }

    pub fn leaf_count(&self) -> u64 {
        self.branching.iter().map(|b| u64::from(*b)).product()
    }

    pub fn node_count(&self) -> u64 {
        let mut level = 1u64;
        let mut total = 1u64;
        for b in &self.branching {
            level *= u64::from(*b);
            total += level;
        }
        total
    }
}

/// Degradation metadata for any node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BranchMeta {
    /// Lower values are disabled first under budget pressure.
    pub priority: u32,
    /// Only optional branches may be disabled.
    pub optional: bool,
}

/// Specification of an internal node.
#[derive(Clone)]
pub struct InternalSpec {
    pub combine: Combiner,
    pub escalation: EscalationPolicy,
    pub overhead: ResourceCost,
    pub meta: BranchMeta,
}

impl InternalSpec {
    pub fn new(combine: Combiner, escalation: EscalationPolicy) -> Self {
        Self {
            combine,
            escalation,
            overhead: ResourceCost::zero(),
            meta: BranchMeta::default(),
        }
    }

    pub fn with_overhead(mut self, units: u64) -> Self {
        self.overhead = ResourceCost::new(units);
        self
    }

    pub fn with_meta(mut self, meta: BranchMeta) -> Self {
        self.meta = meta;
        self
    }
}

impl Default for InternalSpec {
    fn default() -> Self {
        Self::new(combine::collect_array(), EscalationPolicy::forward_all())
    }
}

/// Specification of a leaf.
#[derive(Clone)]
pub struct LeafSpec {
    pub collaborator: Arc<dyn Collaborator>,
    /// Falls back to the configured default when `None`.
    pub confidence_threshold: Option<f64>,
    pub meta: BranchMeta,
}

impl LeafSpec {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self {
            collaborator,
            confidence_threshold: None,
            meta: BranchMeta::default(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = Some(threshold);
        self
    }

    pub fn with_meta(mut self, meta: BranchMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// Supplies node specifications while a tree is built.
pub trait NodeFactory {
    fn internal(&self, id: &NodeId) -> InternalSpec;

    fn leaf(&self, id: &NodeId) -> LeafSpec;
}
