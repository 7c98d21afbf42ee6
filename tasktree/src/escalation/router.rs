//! Escalation Router: sequences the climb from the origin's parent to the
//! lowest node willing and authorized to decide.
//!
//! The router holds no policy of its own. At each hop it asks the node's
//! [`EscalationPolicy`]; the root is terminal and must answer. Parent links
//! are the arena's non-owning back-indices, which always point at a lower
//! index, so the climb ends after at most `depth` forwards.

use tracing::{debug, warn};

use crate::envelope::{LogEntry, NodeId};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::tree::Tree;

use super::policy::EscalationPolicy;
use super::types::{Decision, EscalationAudit, EscalationHop, EscalationRequest, HopAction};

/// Result of asking one node about a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteStep {
    Decide(Decision),
    Forward,
}

/// A decided escalation plus everything needed to audit it.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub decision: Decision,
    pub audit: EscalationAudit,
    /// One entry per hop, in climb order.
    pub logs: Vec<LogEntry>,
}

/// Stateless climb sequencer.
#[derive(Debug, Default, Clone, Copy)]
pub struct EscalationRouter;

impl EscalationRouter {
    pub fn new() -> Self {
        Self
    }

    /// Ask a single node. A terminal node that has no answer is a policy gap.
    pub fn route(
        &self,
        node: &NodeId,
        policy: Option<&EscalationPolicy>,
        request: &EscalationRequest,
        terminal: bool,
    ) -> OrchestratorResult<RouteStep> {
        if terminal {
            return match policy.and_then(|p| p.decide(request)) {
                Some(decision) => Ok(RouteStep::Decide(decision)),
                None => Err(OrchestratorError::policy_gap(
                    request.origin.clone(),
                    format!("{} has no rule for {}", node, request.reason),
                )),
            };
        }

        let Some(policy) = policy else {
            return Ok(RouteStep::Forward);
        };
        if !policy.can_decide(request) {
            return Ok(RouteStep::Forward);
        }
        match policy.decide(request) {
            Some(decision) => Ok(RouteStep::Decide(decision)),
            None => {
                debug!(node = %node, origin = %request.origin, "In scope but no rule; forwarding");
                Ok(RouteStep::Forward)
            }
        }
    }

    /// Climb from arena index `start` until some node decides.
    ///
    /// Every hop is a suspension point, so a caller can cancel an in-flight
    /// escalation by dropping this future.
    pub async fn escalate(
        &self,
        tree: &Tree,
        start: usize,
        request: EscalationRequest,
    ) -> OrchestratorResult<Resolution> {
        let mut hops = Vec::new();
        let mut logs = Vec::new();
        let mut current = start;

        loop {
            let node = tree.node(current);
            let parent = tree.parent_of(current);
            let step = self.route(
                node.id(),
                node.escalation_policy(),
                &request,
                parent.is_none(),
            )?;

            match (step, parent) {
                (RouteStep::Decide(decision), _) => {
                    debug!(
                        node = %node.id(),
                        origin = %request.origin,
                        chosen = %decision.chosen,
                        forwards = hops.len(),
                        "Escalation decided"
                    );
                    hops.push(EscalationHop {
                        node: node.id().clone(),
                        action: HopAction::Decided,
                    });
                    logs.push(LogEntry::warn(
                        node.id(),
                        format!(
                            "decided escalation from {} ({}): {}",
                            request.origin, request.reason, decision.chosen
                        ),
                    ));
                    let audit = EscalationAudit {
                        origin: request.origin.clone(),
                        reason: request.reason.clone(),
                        hops,
                        decided_by: Some(node.id().clone()),
                        chosen: decision.chosen,
                        cancelled_by_timeout: false,
                    };
                    return Ok(Resolution {
                        decision,
                        audit,
                        logs,
                    });
                }
                (RouteStep::Forward, Some(parent)) => {
                    hops.push(EscalationHop {
                        node: node.id().clone(),
                        action: HopAction::Forwarded,
                    });
                    logs.push(LogEntry::warn(
                        node.id(),
                        format!(
                            "forwarded escalation from {} ({}) to {}",
                            request.origin,
                            request.reason,
                            tree.node(parent).id()
                        ),
                    ));
                    current = parent;
                    tokio::task::yield_now().await;
                }
                (RouteStep::Forward, None) => {
                    // route() never forwards from a terminal node
                    warn!(node = %node.id(), "Terminal node forwarded an escalation");
                    return Err(OrchestratorError::policy_gap(
                        request.origin.clone(),
                        "escalation climbed past the root",
                    ));
                }
            }
        }
    }
}
