//! tasktree: hierarchical task orchestration over a fixed-shape tree.
//!
//! Work is decomposed across a tree of nodes. Leaves wrap external
//! collaborators; internal nodes fan requests out to their children, merge
//! the results, route escalations upward and report cost to a per-run
//! budget tracker. The root is the [`Orchestrator`].
//!
//! ```text
//!                      Orchestrator (root)
//!                     ┌──────┴──────┐
//!                 internal       internal      ← aggregate, escalate
//!                 ┌──┴──┐        ┌──┴──┐
//!               leaf   leaf    leaf   leaf     ← collaborator calls
//! ```

pub mod aggregate;
pub mod budget;
pub mod config;
pub mod envelope;
pub mod error;
pub mod escalation;
pub mod leaf;
pub mod orchestrator;
pub mod request;
pub mod status;
pub mod tree;

pub use aggregate::{combine, AggregationEngine, ChildValue, Combiner, LogFilter};
pub use budget::{
    BudgetSnapshot, BudgetState, BudgetTracker, DegradationAction, DegradationCommand,
    DegradationParams, DegradationPolicy, GreedyPriorityPolicy,
};
pub use config::OrchestratorConfig;
pub use envelope::{LogEntry, LogLevel, NodeId, ResourceCost, ResultEnvelope};
pub use error::{ErrorKind, OrchestratorError, OrchestratorResult};
pub use escalation::{
    Choice, Decision, EscalationAudit, EscalationPolicy, EscalationReason, EscalationRequest,
    EscalationRouter,
};
pub use leaf::{Collaborator, CollaboratorError, Invocation, LeafExecutor};
pub use orchestrator::{CycleProgress, Orchestrator, OutcomeKind, ProgressFeed, RunOutcome};
pub use request::{Annotation, Dispatch, LeafCall, Request};
pub use status::Status;
pub use tree::{BranchMeta, InternalSpec, LeafSpec, NodeFactory, NodePhase, Tree, TreeShape};
