//! Resource Budget Tracker: per-run consumption counter with projection.
//!
//! ```text
//! Tracking ──► Warning ──► Adapting ──► Exhausted
//!     │           │           │
//!     └───────────┴───────────┴───────► Completed
//! ```
//!
//! Transitions only move forward. Cost reports check the ceiling; progress
//! reports re-run the projection. Entering (or staying in) `Adapting` asks the
//! [`DegradationPolicy`] for more actions; the resulting command is held as
//! pending until the orchestrator starts its next dispatch cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::envelope::{NodeId, ResourceCost};

use super::degradation::{
    project, remaining_factor, BranchCandidate, DegradationCommand, DegradationParams,
    DegradationPolicy, PlanningContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Tracking,
    Warning,
    Adapting,
    Exhausted,
    Completed,
}

impl BudgetState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exhausted | Self::Completed)
    }
}

impl std::fmt::Display for BudgetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tracking => write!(f, "tracking"),
            Self::Warning => write!(f, "warning"),
            Self::Adapting => write!(f, "adapting"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Point-in-time view of the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub state: BudgetState,
    pub current: u64,
    pub projected: f64,
    pub ceiling: u64,
    pub fraction_done: f64,
    pub active: DegradationParams,
}

pub struct BudgetTracker {
    ceiling: u64,
    warning_ratio: f64,
    sampling_factor: f64,
    quality_factor: f64,
    current: u64,
    fraction_done: f64,
    state: BudgetState,
    params: DegradationParams,
    pending: Option<DegradationCommand>,
    issued: DegradationCommand,
    candidates: Vec<BranchCandidate>,
    candidate_ids: HashSet<NodeId>,
    branch_costs: HashMap<NodeId, u64>,
    policy: Arc<dyn DegradationPolicy>,
    transitions: Vec<(BudgetState, BudgetState)>,
}

impl BudgetTracker {
    pub fn new(
        ceiling: u64,
        config: &OrchestratorConfig,
        candidates: Vec<BranchCandidate>,
        policy: Arc<dyn DegradationPolicy>,
    ) -> Self {
        let candidate_ids = candidates.iter().map(|c| c.node.clone()).collect();
        Self {
            ceiling,
            warning_ratio: config.warning_ratio,
            sampling_factor: config.sampling_reduction_factor,
            quality_factor: config.quality_reduction_factor,
            current: 0,
            fraction_done: 0.0,
            state: BudgetState::Tracking,
            params: DegradationParams::default(),
            pending: None,
            issued: DegradationCommand::default(),
            candidates,
            candidate_ids,
            branch_costs: HashMap::new(),
            policy,
            transitions: Vec::new(),
        }
    }

    /// Add an aggregated cost report.
    ///
    /// Only the ceiling is checked here. The projection is re-evaluated when
    /// progress is next reported, since it would otherwise pair new cost with
    /// a stale progress figure.
    pub fn record(&mut self, increment: ResourceCost) {
        self.current = self.current.saturating_add(increment.units_consumed);
        if self.current >= self.ceiling {
            self.evaluate();
        }
    }

    /// Attribute subtree cost to a candidate branch. Non-candidates are ignored.
    pub fn record_branch(&mut self, node: &NodeId, cost: ResourceCost) {
        if self.candidate_ids.contains(node) {
            *self.branch_costs.entry(node.clone()).or_insert(0) += cost.units_consumed;
        }
    }

    /// Update the progress signal and re-evaluate.
    pub fn set_progress(&mut self, fraction_done: f64) {
        self.fraction_done = fraction_done.clamp(0.0, 1.0);
        self.evaluate();
    }

    /// Fold a command into the active parameters.
    ///
    /// Returns whether anything changed; a repeated command changes nothing.
    pub fn apply(&mut self, command: &DegradationCommand) -> bool {
        let changed = self.params.apply(command);
        if changed {
            self.issued.merge(command.clone());
        }
        changed
    }

    /// Take the command produced since the last dispatch cycle.
    pub fn take_pending(&mut self) -> Option<DegradationCommand> {
        self.pending.take()
    }

    /// Mark the run finished under budget. No effect once exhausted.
    pub fn complete(&mut self) {
        if self.state != BudgetState::Exhausted {
            self.transition(BudgetState::Completed);
        }
    }

    pub fn projected(&self) -> f64 {
        project(
            self.current,
            self.fraction_done,
            remaining_factor(
                self.current,
                &self.params,
                &self.branch_costs,
                self.sampling_factor,
                self.quality_factor,
            ),
        )
    }

    pub fn state(&self) -> BudgetState {
        self.state
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn remaining(&self) -> u64 {
        self.ceiling.saturating_sub(self.current)
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == BudgetState::Exhausted
    }

    pub fn active_params(&self) -> &DegradationParams {
        &self.params
    }

    /// Every action issued during the run, in issue order.
    pub fn issued(&self) -> &DegradationCommand {
        &self.issued
    }

    pub fn transitions(&self) -> &[(BudgetState, BudgetState)] {
        &self.transitions
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            state: self.state,
            current: self.current,
            projected: self.projected(),
            ceiling: self.ceiling,
            fraction_done: self.fraction_done,
            active: self.params.clone(),
        }
    }

    fn evaluate(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        if self.current >= self.ceiling {
            warn!(
                current = self.current,
                ceiling = self.ceiling,
                "Budget exhausted"
            );
            self.transition(BudgetState::Exhausted);
            return;
        }

        let ceiling = self.ceiling as f64;
        let projected = self.projected();
        if projected > ceiling {
            self.transition(BudgetState::Adapting);
            self.adapt();
        } else if projected > ceiling * self.warning_ratio {
            self.transition(BudgetState::Warning);
        }
    }

    fn adapt(&mut self) {
        let command = {
            let ctx = PlanningContext {
                current: self.current,
                fraction_done: self.fraction_done,
                ceiling: self.ceiling,
                active: &self.params,
                candidates: &self.candidates,
                branch_costs: &self.branch_costs,
                sampling_factor: self.sampling_factor,
                quality_factor: self.quality_factor,
            };
            self.policy.plan(&ctx)
        };

        if command.is_empty() {
            debug!(policy = self.policy.name(), "No further degradation available");
            return;
        }
        if !self.apply(&command) {
            return;
        }

        let actions: Vec<String> = command.actions.iter().map(|a| a.to_string()).collect();
        info!(
            policy = self.policy.name(),
            actions = ?actions,
            projected = self.projected(),
            ceiling = self.ceiling,
            "Degradation command issued"
        );
        match self.pending.as_mut() {
            Some(pending) => pending.merge(command),
            None => self.pending = Some(command),
        }
    }

    /// Move forward only; later states are never undone.
    fn transition(&mut self, to: BudgetState) {
        let from = self.state;
        if to <= from {
            return;
        }
        debug!(from = %from, to = %to, current = self.current, "Budget transition");
        self.transitions.push((from, to));
        self.state = to;
    }
}

impl std::fmt::Debug for BudgetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetTracker")
            .field("state", &self.state)
            .field("current", &self.current)
            .field("ceiling", &self.ceiling)
            .field("fraction_done", &self.fraction_done)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::degradation::{DegradationAction, GreedyPriorityPolicy};

    fn tracker(ceiling: u64, candidates: Vec<BranchCandidate>) -> BudgetTracker {
        BudgetTracker::new(
            ceiling,
            &OrchestratorConfig::default(),
            candidates,
            Arc::new(GreedyPriorityPolicy),
        )
    }

    fn node(path: &[u32]) -> NodeId {
        NodeId::from_path(path.to_vec())
    }

    #[test]
    fn test_stays_tracking_under_warning() {
        let mut t = tracker(1000, vec![]);
        t.record(ResourceCost::new(100));
        t.set_progress(0.5);
        // projected 200
        assert_eq!(t.state(), BudgetState::Tracking);
    }

    #[test]
    fn test_enters_warning() {
        let mut t = tracker(1000, vec![]);
        t.record(ResourceCost::new(450));
        t.set_progress(0.5);
        // projected 900 > 800
        assert_eq!(t.state(), BudgetState::Warning);
        assert!(t.take_pending().is_none());
    }

    #[test]
    fn test_adapting_emits_command() {
        let mut t = tracker(400, vec![BranchCandidate { node: node(&[1]), priority: 1 }]);
        t.record_branch(&node(&[1]), ResourceCost::new(50));
        t.record(ResourceCost::new(100));
        t.set_progress(0.2);

        assert_eq!(t.state(), BudgetState::Adapting);
        let command = t.take_pending().unwrap();
        assert_eq!(
            command.actions[0],
            DegradationAction::DisableOptionalBranch { node: node(&[1]) }
        );
        assert!(t.projected() <= 400.0);
        assert!(t.take_pending().is_none());
    }

    #[test]
    fn test_apply_same_command_twice_leaves_projection() {
        let mut t = tracker(10_000, vec![BranchCandidate { node: node(&[0]), priority: 1 }]);
        t.record_branch(&node(&[0]), ResourceCost::new(30));
        t.record(ResourceCost::new(100));
        t.set_progress(0.25);

        let command = DegradationCommand::new(vec![
            DegradationAction::DisableOptionalBranch { node: node(&[0]) },
            DegradationAction::LowerQualityTarget,
        ]);
        assert!(t.apply(&command));
        let once = t.projected();
        assert!(!t.apply(&command));
        assert_eq!(t.projected(), once);
    }

    #[test]
    fn test_exhausted_is_terminal() {
        let mut t = tracker(100, vec![]);
        t.record(ResourceCost::new(100));
        assert!(t.is_exhausted());
        t.complete();
        assert_eq!(t.state(), BudgetState::Exhausted);
    }

    #[test]
    fn test_complete_from_warning() {
        let mut t = tracker(1000, vec![]);
        t.record(ResourceCost::new(450));
        t.set_progress(0.5);
        t.complete();
        assert_eq!(t.state(), BudgetState::Completed);
        assert_eq!(
            t.transitions().last(),
            Some(&(BudgetState::Warning, BudgetState::Completed))
        );
    }

    #[test]
    fn test_state_never_moves_backward() {
        let mut t = tracker(1000, vec![]);
        t.record(ResourceCost::new(450));
        t.set_progress(0.5);
        assert_eq!(t.state(), BudgetState::Warning);
        t.set_progress(0.99);
        assert_eq!(t.state(), BudgetState::Warning);
    }

    #[test]
    fn test_current_is_monotonic() {
        let mut t = tracker(1_000_000, vec![]);
        let mut last = 0;
        for units in [5, 0, 12, 3] {
            t.record(ResourceCost::new(units));
            assert!(t.current() >= last);
            last = t.current();
        }
        assert_eq!(t.current(), 20);
    }

    #[test]
    fn test_non_candidate_branch_cost_ignored() {
        let mut t = tracker(1000, vec![]);
        t.record_branch(&node(&[3]), ResourceCost::new(99));
        t.record(ResourceCost::new(10));
        t.set_progress(0.5);
        assert_eq!(t.projected(), 20.0);
    }
}
