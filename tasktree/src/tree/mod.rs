//! Tree: fixed-shape arena of nodes built once at startup.

pub mod arena;
pub mod phase;
pub mod shape;

pub use arena::{Node, NodeKind, Tree};
pub use phase::{IllegalTransition, NodePhase, PhaseTracker};
pub use shape::{BranchMeta, InternalSpec, LeafSpec, NodeFactory, TreeShape};
