//! Degradation commands and the policy that chooses them.
//!
//! A [`DegradationCommand`] is a list of actions. Applying it folds the
//! actions into [`DegradationParams`], the annotation carried by subsequent
//! dispatches. Application is a set union, so applying the same command twice
//! changes nothing the second time.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::envelope::NodeId;

/// A single controlled reduction in work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DegradationAction {
    ReduceSamplingRate,
    DisableOptionalBranch { node: NodeId },
    LowerQualityTarget,
}

impl std::fmt::Display for DegradationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReduceSamplingRate => write!(f, "reduce_sampling_rate"),
            Self::DisableOptionalBranch { node } => write!(f, "disable_optional_branch({})", node),
            Self::LowerQualityTarget => write!(f, "lower_quality_target"),
        }
    }
}

/// Ordered degradation actions, broadcast on the next dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationCommand {
    pub actions: Vec<DegradationAction>,
}

impl DegradationCommand {
    pub fn new(actions: Vec<DegradationAction>) -> Self {
        Self { actions }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Append actions not already present.
    pub fn merge(&mut self, other: DegradationCommand) {
        for action in other.actions {
            if !self.actions.contains(&action) {
                self.actions.push(action);
            }
        }
    }
}

/// Degradation in force, as carried by a dispatch annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationParams {
    pub disabled: BTreeSet<NodeId>,
    pub reduced_sampling: bool,
    pub lowered_quality: bool,
}

impl DegradationParams {
    /// Fold a command in. Returns whether anything changed.
    pub fn apply(&mut self, command: &DegradationCommand) -> bool {
        let mut changed = false;
        for action in &command.actions {
            match action {
                DegradationAction::ReduceSamplingRate => {
                    changed |= !self.reduced_sampling;
                    self.reduced_sampling = true;
                }
                DegradationAction::LowerQualityTarget => {
                    changed |= !self.lowered_quality;
                    self.lowered_quality = true;
                }
                DegradationAction::DisableOptionalBranch { node } => {
                    changed |= self.disabled.insert(node.clone());
                }
            }
        }
        changed
    }

    /// Whether `node` or one of its ancestors is disabled.
    pub fn is_disabled(&self, node: &NodeId) -> bool {
        self.disabled
            .iter()
            .any(|d| d == node || d.is_ancestor_of(node))
    }

    pub fn is_active(&self) -> bool {
        !self.disabled.is_empty() || self.reduced_sampling || self.lowered_quality
    }

    /// Disabled nodes with no disabled ancestor.
    pub fn top_disabled(&self) -> impl Iterator<Item = &NodeId> {
        self.disabled
            .iter()
            .filter(move |n| !self.disabled.iter().any(|d| d.is_ancestor_of(n)))
    }
}

/// An optional branch the policy may switch off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchCandidate {
    pub node: NodeId,
    /// Lower values are disabled first.
    pub priority: u32,
}

/// Inputs to a degradation policy.
#[derive(Debug, Clone)]
pub struct PlanningContext<'a> {
    pub current: u64,
    pub fraction_done: f64,
    pub ceiling: u64,
    pub active: &'a DegradationParams,
    pub candidates: &'a [BranchCandidate],
    /// Cumulative subtree cost observed per candidate branch.
    pub branch_costs: &'a HashMap<NodeId, u64>,
    pub sampling_factor: f64,
    pub quality_factor: f64,
}

impl PlanningContext<'_> {
    /// Projection if `params` were in force for the remaining work.
    pub fn projected_with(&self, params: &DegradationParams) -> f64 {
        project(
            self.current,
            self.fraction_done,
            remaining_factor(
                self.current,
                params,
                self.branch_costs,
                self.sampling_factor,
                self.quality_factor,
            ),
        )
    }
}

/// `current + (current / f) * (1 - f) * factor`, with `f` outside (0, 1)
/// meaning nothing is left to project.
pub fn project(current: u64, fraction_done: f64, remaining_factor: f64) -> f64 {
    let current = current as f64;
    if fraction_done <= 0.0 || fraction_done >= 1.0 {
        return current;
    }
    current + (current / fraction_done) * (1.0 - fraction_done) * remaining_factor
}

/// Share of the remaining work still performed under `params`.
pub fn remaining_factor(
    current: u64,
    params: &DegradationParams,
    branch_costs: &HashMap<NodeId, u64>,
    sampling_factor: f64,
    quality_factor: f64,
) -> f64 {
    let mut factor = 1.0;
    if current > 0 {
        let disabled: u64 = params
            .top_disabled()
            .map(|n| branch_costs.get(n).copied().unwrap_or(0))
            .sum();
        factor -= (disabled as f64 / current as f64).min(1.0);
    }
    if params.reduced_sampling {
        factor *= sampling_factor;
    }
    if params.lowered_quality {
        factor *= quality_factor;
    }
    factor.max(0.0)
}

/// Chooses degradation actions when the projection exceeds the ceiling.
pub trait DegradationPolicy: Send + Sync {
    /// Actions to add on top of `ctx.active`. Empty when nothing helps.
    fn plan(&self, ctx: &PlanningContext<'_>) -> DegradationCommand;

    /// Policy name for logging.
    fn name(&self) -> &str;
}

/// Disable the lowest-priority optional branches first until the projection
/// fits; then reduce sampling, then lower quality.
#[derive(Debug, Clone, Default)]
pub struct GreedyPriorityPolicy;

impl DegradationPolicy for GreedyPriorityPolicy {
    fn plan(&self, ctx: &PlanningContext<'_>) -> DegradationCommand {
        let ceiling = ctx.ceiling as f64;
        let mut params = ctx.active.clone();
        let mut actions = Vec::new();

        let mut candidates: Vec<&BranchCandidate> = ctx.candidates.iter().collect();
        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.node.cmp(&b.node)));

        for candidate in candidates {
            if ctx.projected_with(&params) <= ceiling {
                break;
            }
            if params.is_disabled(&candidate.node) {
                continue;
            }
            let action = DegradationAction::DisableOptionalBranch {
                node: candidate.node.clone(),
            };
            params.apply(&DegradationCommand::new(vec![action.clone()]));
            actions.push(action);
        }

        for action in [
            DegradationAction::ReduceSamplingRate,
            DegradationAction::LowerQualityTarget,
        ] {
            if ctx.projected_with(&params) <= ceiling {
                break;
            }
            let command = DegradationCommand::new(vec![action.clone()]);
            if params.apply(&command) {
                actions.push(action);
            }
        }

        DegradationCommand::new(actions)
    }

    fn name(&self) -> &str {
        "greedy_priority"
    }
}
