//! Budget: per-run resource accounting and adaptive degradation.
//!
//! The tracker is the only state shared by concurrently executing branches.
//! It is updated with aggregated cost reports from internal nodes, never
//! per leaf, behind a single lock owned by the run.

pub mod degradation;
pub mod tracker;

pub use degradation::{
    BranchCandidate, DegradationAction, DegradationCommand, DegradationParams, DegradationPolicy,
    GreedyPriorityPolicy, PlanningContext,
};
pub use tracker::{BudgetSnapshot, BudgetState, BudgetTracker};
