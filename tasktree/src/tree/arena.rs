//! Arena-backed immutable tree.
//!
//! Nodes live in one `Vec` in breadth-first order. Children are referenced by
//! index; the parent link is a non-owning back-index used only for
//! escalation routing. A parent's index is always lower than its children's.

use std::collections::VecDeque;

use tracing::debug;

use crate::aggregate::Combiner;
use crate::budget::BranchCandidate;
use crate::config::OrchestratorConfig;
use crate::envelope::{NodeId, ResourceCost};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::escalation::EscalationPolicy;
use crate::leaf::LeafExecutor;

use super::shape::{BranchMeta, InternalSpec, NodeFactory, TreeShape};

pub enum NodeKind {
    Internal(InternalSpec),
    Leaf(LeafExecutor),
}

pub struct Node {
    id: NodeId,
    parent: Option<usize>,
    children: Vec<usize>,
    kind: NodeKind,
    meta: BranchMeta,
}

impl Node {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn meta(&self) -> BranchMeta {
        self.meta
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn escalation_policy(&self) -> Option<&EscalationPolicy> {
        match &self.kind {
            NodeKind::Internal(spec) => Some(&spec.escalation),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn combiner(&self) -> Option<&Combiner> {
        match &self.kind {
            NodeKind::Internal(spec) => Some(&spec.combine),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn overhead(&self) -> ResourceCost {
        match &self.kind {
            NodeKind::Internal(spec) => spec.overhead,
            NodeKind::Leaf(_) => ResourceCost::zero(),
        }
    }

    pub fn leaf(&self) -> Option<&LeafExecutor> {
        match &self.kind {
            NodeKind::Leaf(executor) => Some(executor),
            NodeKind::Internal(_) => None,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("leaf", &self.is_leaf())
            .field("meta", &self.meta)
            .finish()
    }
}

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    depth: usize,
}

impl Tree {
    /// Arena index of the root.
    pub const ROOT: usize = 0;

    /// Build the tree once from a shape; it is immutable afterwards.
    pub fn build(
        shape: &TreeShape,
        factory: &dyn NodeFactory,
        config: &OrchestratorConfig,
    ) -> OrchestratorResult<Self> {
        shape.validate()?;
        let depth = shape.depth();
        let mut nodes: Vec<Node> = Vec::new();

        let root_spec = factory.internal(&NodeId::root());
        if root_spec.meta.optional {
            return Err(OrchestratorError::invalid_shape("the root cannot be optional"));
        }
        nodes.push(Node {
            id: NodeId::root(),
            parent: None,
            children: Vec::new(),
            meta: root_spec.meta,
            kind: NodeKind::Internal(root_spec),
        });

        let mut queue = VecDeque::from([Tree::ROOT]);
        while let Some(parent_idx) = queue.pop_front() {
            let parent_id = nodes[parent_idx].id.clone();
            let level = parent_id.depth();
            if level >= depth {
                continue;
            }
            let child_is_leaf = level + 1 == depth;

            for i in 0..shape.branching[level] {
                let id = parent_id.child(i);
                let node = if child_is_leaf {
                    let spec = factory.leaf(&id);
                    let threshold = spec
                        .confidence_threshold
                        .unwrap_or(config.default_confidence_threshold);
                    if !(0.0..=1.0).contains(&threshold) {
                        return Err(OrchestratorError::invalid_shape(format!(
                            "leaf {} has confidence threshold {} outside [0, 1]",
                            id, threshold
                        )));
                    }
                    Node {
                        id: id.clone(),
                        parent: Some(parent_idx),
                        children: Vec::new(),
                        meta: spec.meta,
                        kind: NodeKind::Leaf(LeafExecutor::new(id, spec.collaborator, threshold)),
                    }
                } else {
                    let spec = factory.internal(&id);
                    Node {
                        id,
                        parent: Some(parent_idx),
                        children: Vec::new(),
                        meta: spec.meta,
                        kind: NodeKind::Internal(spec),
                    }
                };

                let idx = nodes.len();
                nodes.push(node);
                nodes[parent_idx].children.push(idx);
                if !child_is_leaf {
                    queue.push_back(idx);
                }
            }
        }

        debug!(nodes = nodes.len(), depth, "Tree built");
        Ok(Self { nodes, depth })
    }

    pub fn root(&self) -> &Node {
        &self.nodes[Tree::ROOT]
    }

    /// Node at an arena index handed out by this tree.
    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn get(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx)
    }

    pub fn parent_of(&self, idx: usize) -> Option<usize> {
        self.nodes.get(idx).and_then(|n| n.parent)
    }

    /// Arena index for a node id, following the id's path.
    pub fn find(&self, id: &NodeId) -> Option<usize> {
        let mut idx = Tree::ROOT;
        for step in id.path() {
            idx = *self.nodes.get(idx)?.children.get(*step as usize)?;
        }
        Some(idx)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Optional nodes the degradation policy may disable.
    pub fn optional_branches(&self) -> Vec<BranchCandidate> {
        self.nodes
            .iter()
            .filter(|n| n.meta.optional)
            .map(|n| BranchCandidate {
                node: n.id.clone(),
                priority: n.meta.priority,
            })
            .collect()
    }
}
