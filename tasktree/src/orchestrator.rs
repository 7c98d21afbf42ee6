//! Orchestrator: the root of a run.
//!
//! Owns the tree and, for the lifetime of one run, the budget tracker.
//!
//! ```text
//! run(request)
//!   for each batch:
//!     annotation ← tracker (active degradation, remaining units)
//!     root ──spawn──► children ──spawn──► … ──► leaves
//!          ◄── aggregate ◄── apply decision ◄── escalate ◄── join (deadline)
//!     tracker.set_progress(feed)
//!   RunOutcome
//! ```
//!
//! Every internal node spawns its children as tasks and joins them in sibling
//! order against its children's deadline. Late children are aborted and
//! reported as `Failed("timeout")`. Dropping a node's task aborts its whole
//! subtree.
//!
//! Deadlines seen by one node, for a dispatch margin `m`:
//!
//! ```text
//!   children joined      escalations + retries      parent stops waiting
//!   deadline - m    ───► deadline - m/2        ───► deadline
//! ```

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::AggregationEngine;
use crate::budget::{
    BudgetSnapshot, BudgetTracker, DegradationCommand, DegradationPolicy, GreedyPriorityPolicy,
};
use crate::config::OrchestratorConfig;
use crate::envelope::{LogEntry, NodeId, ResourceCost, ResultEnvelope};
use crate::error::{ErrorKind, OrchestratorError, OrchestratorResult};
use crate::escalation::{
    Choice, Decision, EscalationAudit, EscalationReason, EscalationRequest, EscalationRouter,
    Resolution,
};
use crate::request::{Annotation, Dispatch, LeafCall, Request};
use crate::status::Status;
use crate::tree::{InternalSpec, NodeFactory, NodeKind, NodePhase, PhaseTracker, Tree, TreeShape};

/// Source of the `fraction_done` signal used by budget projection.
pub trait ProgressFeed: Send + Sync {
    /// Called after each dispatch cycle. Values outside `[0, 1]` are clamped.
    fn fraction_done(&self, completed_cycles: usize, total_cycles: usize) -> f64;
}

/// Progress as completed cycles over total cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleProgress;

impl ProgressFeed for CycleProgress {
    fn fraction_done(&self, completed_cycles: usize, total_cycles: usize) -> f64 {
        if total_cycles == 0 {
            return 1.0;
        }
        completed_cycles as f64 / total_cycles as f64
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    /// Finalized early with a partial aggregate.
    BudgetExhausted,
    /// The root could not decide an escalation. No result is returned.
    PolicyGap,
    /// Aborted by an internal defect other than a policy gap.
    Aborted,
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
            Self::PolicyGap => write!(f, "policy_gap"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// What the orchestrator hands back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub kind: OutcomeKind,
    /// `None` only for fatal outcomes.
    pub final_value: Option<Value>,
    pub final_status: Status,
    pub aggregated_logs: Vec<LogEntry>,
    pub total_cost: ResourceCost,
    pub escalation_audit: Vec<EscalationAudit>,
    pub budget: BudgetSnapshot,
    /// Every degradation action issued during the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation: Option<DegradationCommand>,
    pub cycles_completed: u32,
}

impl RunOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, OutcomeKind::PolicyGap | OutcomeKind::Aborted)
    }
}

/// Per-run shared state. The tracker is the only mutable part.
struct RunContext {
    tree: Arc<Tree>,
    config: OrchestratorConfig,
    engine: AggregationEngine,
    router: EscalationRouter,
    budget: Mutex<BudgetTracker>,
}

/// A spawned child that is aborted when its parent stops waiting for it.
struct ChildTask {
    index: usize,
    handle: JoinHandle<OrchestratorResult<ResultEnvelope>>,
}

impl Drop for ChildTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct Orchestrator {
    tree: Arc<Tree>,
    config: OrchestratorConfig,
    policy: Arc<dyn DegradationPolicy>,
    progress: Arc<dyn ProgressFeed>,
}

impl Orchestrator {
    pub fn new(tree: Tree, config: OrchestratorConfig) -> Self {
        Self {
            tree: Arc::new(tree),
            config,
            policy: Arc::new(GreedyPriorityPolicy),
            progress: Arc::new(CycleProgress),
        }
    }

    /// Validate `config` and build the tree from `shape`.
    pub fn build(
        shape: &TreeShape,
        factory: &dyn NodeFactory,
        config: OrchestratorConfig,
    ) -> OrchestratorResult<Self> {
        config.validate()?;
        let tree = Tree::build(shape, factory, &config)?;
        Ok(Self::new(tree, config))
    }

    pub fn with_policy(mut self, policy: Arc<dyn DegradationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressFeed>) -> Self {
        self.progress = progress;
        self
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Execute one run. Always returns an outcome; fatal conditions are
    /// reported through [`OutcomeKind`].
    pub async fn run(&self, request: Request) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let total = request.batches().len();
        info!(
            run_id = %run_id,
            batches = total,
            ceiling = request.budget_ceiling(),
            policy = self.policy.name(),
            "Run started"
        );

        let tracker = BudgetTracker::new(
            request.budget_ceiling(),
            &self.config,
            self.tree.optional_branches(),
            Arc::clone(&self.policy),
        );
        let ctx = Arc::new(RunContext {
            tree: Arc::clone(&self.tree),
            config: self.config.clone(),
            engine: AggregationEngine::from_config(&self.config),
            router: EscalationRouter::new(),
            budget: Mutex::new(tracker),
        });

        let mut values = Vec::with_capacity(total);
        let mut status = Status::Healthy;
        let mut logs = Vec::new();
        let mut cost = ResourceCost::zero();
        let mut audit = Vec::new();
        let mut exhausted = false;

        for (cycle, payload) in request.batches().iter().enumerate() {
            let annotation = {
                let mut budget = ctx.budget.lock().await;
                if let Some(command) = budget.take_pending() {
                    info!(
                        run_id = %run_id,
                        cycle,
                        actions = command.actions.len(),
                        "Broadcasting degradation command"
                    );
                }
                let active = budget.active_params();
                if active.is_active() {
                    debug!(
                        run_id = %run_id,
                        cycle,
                        disabled = active.disabled.len(),
                        reduced_sampling = active.reduced_sampling,
                        lowered_quality = active.lowered_quality,
                        "Dispatching under degradation"
                    );
                }
                Annotation {
                    cycle: cycle as u32,
                    degradation: budget.active_params().clone(),
                    budget_hint: budget.remaining(),
                }
            };

            let dispatch = Dispatch::new(
                Arc::new(payload.clone()),
                Arc::new(annotation),
                request.deadline(),
            );
            let envelope = match execute_node(Arc::clone(&ctx), Tree::ROOT, dispatch).await {
                Ok(envelope) => envelope,
                Err(err) => {
                    let cycles = values.len() as u32;
                    return self.abort(run_id, &ctx, err, logs, audit, cost, cycles).await;
                }
            };

            debug!(
                run_id = %run_id,
                cycle,
                status = %envelope.status,
                cost = envelope.cost.units_consumed,
                "Cycle finished"
            );
            status = status.worst(envelope.status);
            cost += envelope.cost;
            logs.extend(envelope.logs);
            audit.extend(envelope.audit);
            values.push(envelope.value);

            let mut budget = ctx.budget.lock().await;
            budget.set_progress(self.progress.fraction_done(cycle + 1, total));
            if budget.is_exhausted() {
                exhausted = true;
                break;
            }
        }

        let mut budget = ctx.budget.lock().await;
        let cycles_completed = values.len() as u32;
        let kind = if exhausted {
            warn!(
                run_id = %run_id,
                cycles_completed,
                current = budget.current(),
                ceiling = budget.ceiling(),
                "Budget exhausted; finalizing early"
            );
            logs.push(LogEntry::warn(
                &NodeId::root(),
                format!(
                    "budget exhausted after {} of {} cycles",
                    cycles_completed, total
                ),
            ));
            if !status.is_failed() {
                status = Status::degraded(ErrorKind::BudgetExhausted.status_reason(""));
            }
            OutcomeKind::BudgetExhausted
        } else {
            budget.complete();
            OutcomeKind::Completed
        };

        let final_value = if total == 1 {
            values.pop()
        } else {
            Some(Value::Array(values))
        };
        let issued = budget.issued().clone();

        info!(
            run_id = %run_id,
            kind = %kind,
            status = %status,
            cost = cost.units_consumed,
            "Run finished"
        );
        RunOutcome {
            run_id,
            kind,
            final_value,
            final_status: status,
            aggregated_logs: logs,
            total_cost: cost,
            escalation_audit: audit,
            budget: budget.snapshot(),
            degradation: (!issued.is_empty()).then_some(issued),
            cycles_completed,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn abort(
        &self,
        run_id: Uuid,
        ctx: &RunContext,
        err: OrchestratorError,
        mut logs: Vec<LogEntry>,
        audit: Vec<EscalationAudit>,
        cost: ResourceCost,
        cycles_completed: u32,
    ) -> RunOutcome {
        error!(run_id = %run_id, error = %err, "Run aborted");

        let (kind, reason) = match &err {
            OrchestratorError::PolicyGap { reason, .. } => (
                OutcomeKind::PolicyGap,
                ErrorKind::EscalationUnresolved.status_reason(reason),
            ),
            other => (OutcomeKind::Aborted, other.to_string()),
        };
        logs.push(LogEntry::error(&NodeId::root(), err.to_string()));

        let budget = ctx.budget.lock().await;
        let issued = budget.issued().clone();
        RunOutcome {
            run_id,
            kind,
            final_value: None,
            final_status: Status::failed(reason),
            aggregated_logs: logs,
            total_cost: cost,
            escalation_audit: audit,
            budget: budget.snapshot(),
            degradation: (!issued.is_empty()).then_some(issued),
            cycles_completed,
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("nodes", &self.tree.len())
            .field("depth", &self.tree.depth())
            .field("policy", &self.policy.name())
            .field("config", &self.config)
            .finish()
    }
}

/// Execute the node at arena index `idx`. Boxed so subtrees can be spawned.
fn execute_node(
    ctx: Arc<RunContext>,
    idx: usize,
    dispatch: Dispatch,
) -> BoxFuture<'static, OrchestratorResult<ResultEnvelope>> {
    async move {
        match ctx.tree.node(idx).kind() {
            NodeKind::Leaf(executor) => {
                let call = LeafCall::from_dispatch(executor.node(), &dispatch);
                Ok(executor.execute(&call).await)
            }
            NodeKind::Internal(spec) => execute_internal(&ctx, idx, spec, &dispatch).await,
        }
    }
    .boxed()
}

async fn execute_internal(
    ctx: &Arc<RunContext>,
    idx: usize,
    spec: &InternalSpec,
    dispatch: &Dispatch,
) -> OrchestratorResult<ResultEnvelope> {
    let node = ctx.tree.node(idx);
    let id = node.id();
    let mut phase = PhaseTracker::new(id);
    let mut own_logs = Vec::new();

    phase.enter(NodePhase::Dispatching);
    let child_dispatch = dispatch.for_child(ctx.config.dispatch_margin());
    let mut tasks = Vec::with_capacity(node.children().len());
    for &child in node.children() {
        let child_id = ctx.tree.node(child).id();
        if dispatch.is_disabled(child_id) {
            info!(node = %id, child = %child_id, "Skipping disabled branch");
            own_logs.push(LogEntry::info(id, format!("skipped disabled branch {}", child_id)));
            continue;
        }
        tasks.push(ChildTask {
            index: child,
            handle: tokio::spawn(execute_node(Arc::clone(ctx), child, child_dispatch.clone())),
        });
    }

    phase.enter(NodePhase::AwaitingChildren);
    let mut results: Vec<(usize, ResultEnvelope)> = Vec::with_capacity(tasks.len());
    for mut task in tasks {
        let child_id = ctx.tree.node(task.index).id();
        let envelope =
            match tokio::time::timeout_at(child_dispatch.deadline, &mut task.handle).await {
                Ok(Ok(Ok(envelope))) => envelope,
                // remaining tasks are aborted as they drop
                Ok(Ok(Err(err))) => return Err(err),
                Ok(Err(join_err)) => contained_failure(id, child_id, &join_err),
                Err(_) => {
                    warn!(node = %id, child = %child_id, "Child missed its deadline");
                    ResultEnvelope::failed(
                        child_id,
                        ErrorKind::Timeout.status_reason(""),
                        ResourceCost::zero(),
                    )
                    .with_log(LogEntry::error(
                        id,
                        format!("{} did not finish before the deadline; cancelled", child_id),
                    ))
                }
            };
        results.push((task.index, envelope));
    }

    phase.enter(NodePhase::Aggregating);
    let decision_deadline = dispatch.decision_deadline(ctx.config.dispatch_margin());
    for (child, envelope) in results.iter_mut() {
        let Some(request) = envelope.escalation.take() else {
            continue;
        };
        phase.enter(NodePhase::AwaitingDecision);
        let resolution = resolve(ctx, idx, decision_deadline, request).await?;
        apply_decision(ctx, *child, decision_deadline, &child_dispatch, envelope, resolution)
            .await;
        phase.enter(NodePhase::Aggregating);
    }

    {
        let mut budget = ctx.budget.lock().await;
        let mut increment = node.overhead();
        for (child, envelope) in &results {
            budget.record_branch(&envelope.node, envelope.cost);
            if ctx.tree.node(*child).is_leaf() {
                increment += envelope.cost;
            }
        }
        budget.record(increment);
    }

    let dispatched = results.len();
    own_logs.push(LogEntry::info(
        id,
        format!(
            "aggregated {} of {} children",
            dispatched,
            node.children().len()
        ),
    ));
    let children = results.into_iter().map(|(_, envelope)| envelope).collect();
    let envelope = ctx
        .engine
        .aggregate(id, children, node.overhead(), &spec.combine, own_logs)?;

    phase.enter(NodePhase::Done);
    debug!(
        node = %id,
        status = %envelope.status,
        cost = envelope.cost.units_consumed,
        "Node done"
    );
    Ok(envelope)
}

/// A child task that panicked or was cancelled, folded into a failure.
fn contained_failure(parent: &NodeId, child: &NodeId, err: &JoinError) -> ResultEnvelope {
    let reason = if err.is_panic() {
        "child task panicked"
    } else {
        "child task cancelled"
    };
    error!(node = %parent, child = %child, "{}", reason);
    ResultEnvelope::failed(child, reason, ResourceCost::zero())
        .with_log(LogEntry::error(parent, format!("{}: {}", child, reason)))
}

/// Route `request` upward from `idx`. If `deadline` passes first the climb
/// is dropped and the request's default choice is used.
async fn resolve(
    ctx: &RunContext,
    idx: usize,
    deadline: Instant,
    request: EscalationRequest,
) -> OrchestratorResult<Resolution> {
    let climb = ctx.router.escalate(&ctx.tree, idx, request.clone());
    match tokio::time::timeout_at(deadline, climb).await {
        Ok(resolution) => resolution,
        Err(_) => {
            let node = ctx.tree.node(idx).id();
            let decision = Decision::default_for(&request);
            warn!(
                node = %node,
                origin = %request.origin,
                default = %decision.chosen,
                "Escalation cancelled by timeout"
            );
            let logs = vec![LogEntry::warn(
                node,
                format!(
                    "escalation from {} cancelled by timeout; using default {}",
                    request.origin, decision.chosen
                ),
            )];
            Ok(Resolution {
                decision,
                audit: EscalationAudit::cancelled(&request, Vec::new()),
                logs,
            })
        }
    }
}

/// Resume the origin with the decided choice.
async fn apply_decision(
    ctx: &RunContext,
    child: usize,
    deadline: Instant,
    child_dispatch: &Dispatch,
    envelope: &mut ResultEnvelope,
    resolution: Resolution,
) {
    let Resolution {
        decision,
        audit,
        logs,
    } = resolution;
    envelope.logs.extend(logs);

    match decision.chosen {
        Choice::AcceptDefault => {}
        Choice::FlagForReview => {
            let status = std::mem::replace(&mut envelope.status, Status::Healthy);
            envelope.status = status.worst(Status::degraded("flagged for review"));
        }
        Choice::RetryWithHigherCost => {
            if let Some(executor) = ctx.tree.node(child).leaf() {
                let call = LeafCall::from_dispatch(executor.node(), child_dispatch)
                    .boosted(ctx.config.retry_cost_multiplier);
                match tokio::time::timeout_at(deadline, executor.execute(&call)).await {
                    Ok(mut retried) => {
                        if let Some(again) = retried.escalation.take() {
                            let message = match (&again.reason, again.confidence()) {
                                (EscalationReason::LowConfidence, Some(c)) => format!(
                                    "retry still below threshold (confidence {:.2}); accepting",
                                    c
                                ),
                                (reason, _) => {
                                    format!("retry escalated again ({}); accepting", reason)
                                }
                            };
                            retried.logs.push(LogEntry::warn(executor.node(), message));
                        }
                        let mut logs = std::mem::take(&mut envelope.logs);
                        logs.append(&mut retried.logs);
                        envelope.logs = logs;
                        envelope.value = retried.value;
                        envelope.status = retried.status;
                        envelope.cost += retried.cost;
                    }
                    Err(_) => {
                        envelope.value = Value::Null;
                        envelope.status = Status::failed(ErrorKind::Timeout.status_reason(""));
                        envelope.logs.push(LogEntry::error(
                            executor.node(),
                            "retry did not finish before the deadline",
                        ));
                    }
                }
            }
        }
    }
    envelope.audit.push(audit);
}
