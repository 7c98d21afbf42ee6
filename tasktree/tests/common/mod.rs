//! Shared fixtures: scripted collaborators and a configurable node factory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tasktree::{
    combine, BranchMeta, Collaborator, CollaboratorError, Combiner, EscalationPolicy,
    EscalationReason, InternalSpec, Invocation, LeafCall, LeafSpec, NodeFactory, NodeId, Orchestrator,
    OrchestratorConfig, Request, RunOutcome, TreeShape,
};

pub fn id(path: &[u32]) -> NodeId {
    NodeId::from_path(path.to_vec())
}

/// What a scripted leaf does when invoked.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed { confidence: f64, units: u64 },
    Fail { message: String, units: u64 },
    /// Low confidence on a normal call, high once boosted by a retry.
    Improves { low: f64, high: f64, units: u64 },
    /// Low confidence on a normal call; a boosted retry never returns.
    HangsWhenBoosted { confidence: f64, units: u64 },
    /// Confident, but reports that its own sub-results disagree.
    Conflicting { units: u64 },
    Hang,
    Panic,
}

impl Behavior {
    pub fn ok(units: u64) -> Self {
        Self::Succeed {
            confidence: 0.95,
            units,
        }
    }

    pub fn unsure(confidence: f64, units: u64) -> Self {
        Self::Succeed { confidence, units }
    }

    pub fn fail(message: &str) -> Self {
        Self::Fail {
            message: message.to_string(),
            units: 1,
        }
    }
}

pub type CallLog = Arc<Mutex<Vec<LeafCall>>>;

/// Records every call, then follows its script.
pub struct ScriptedCollaborator {
    behavior: Behavior,
    calls: CallLog,
}

#[async_trait]
impl Collaborator for ScriptedCollaborator {
    async fn invoke(&self, call: &LeafCall) -> Result<Invocation, CollaboratorError> {
        self.calls.lock().unwrap().push(call.clone());
        let value = |confidence: f64| {
            json!({
                "leaf": call.node.to_string(),
                "score": confidence,
                "boost": call.quality_boost,
                "payload": call.payload.clone(),
            })
        };
        match &self.behavior {
            Behavior::Succeed { confidence, units } => {
                Ok(Invocation::new(value(*confidence), *confidence, *units))
            }
            Behavior::Fail { message, units } => {
                Err(CollaboratorError::new(message.clone()).with_units(*units))
            }
            Behavior::Improves { low, high, units } => {
                let confidence = if call.quality_boost > 1.0 { *high } else { *low };
                Ok(Invocation::new(value(confidence), confidence, *units))
            }
            Behavior::HangsWhenBoosted { confidence, units } => {
                if call.quality_boost > 1.0 {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(Invocation::new(value(*confidence), *confidence, *units))
            }
            Behavior::Conflicting { units } => Ok(Invocation::new(value(0.95), 0.95, *units)
                .with_escalation(EscalationReason::ConflictingResults)),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Invocation::new(Value::Null, 1.0, 0))
            }
            Behavior::Panic => panic!("collaborator exploded"),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Node factory with per-node overrides.
pub struct TestFactory {
    pub default_behavior: Behavior,
    pub behaviors: HashMap<NodeId, Behavior>,
    pub overhead: u64,
    pub root_policy: EscalationPolicy,
    pub inner_policies: HashMap<NodeId, EscalationPolicy>,
    /// Optional branches and their priority.
    pub optional: HashMap<NodeId, u32>,
    pub combine: Combiner,
    pub calls: CallLog,
}

impl TestFactory {
    pub fn new() -> Self {
        Self {
            default_behavior: Behavior::ok(5),
            behaviors: HashMap::new(),
            overhead: 0,
            root_policy: EscalationPolicy::decide_all(tasktree::escalation::accept_default()),
            inner_policies: HashMap::new(),
            optional: HashMap::new(),
            combine: combine::collect_array(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn leaf(mut self, path: &[u32], behavior: Behavior) -> Self {
        self.behaviors.insert(id(path), behavior);
        self
    }

    pub fn default_leaf(mut self, behavior: Behavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    pub fn overhead(mut self, units: u64) -> Self {
        self.overhead = units;
        self
    }

    pub fn root_policy(mut self, policy: EscalationPolicy) -> Self {
        self.root_policy = policy;
        self
    }

    pub fn inner_policy(mut self, path: &[u32], policy: EscalationPolicy) -> Self {
        self.inner_policies.insert(id(path), policy);
        self
    }

    pub fn optional(mut self, path: &[u32], priority: u32) -> Self {
        self.optional.insert(id(path), priority);
        self
    }

    pub fn calls(&self) -> Vec<LeafCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &[u32]) -> Vec<LeafCall> {
        let target = id(path);
        self.calls()
            .into_iter()
            .filter(|c| c.node == target)
            .collect()
    }

    fn meta(&self, node: &NodeId) -> BranchMeta {
        match self.optional.get(node) {
            Some(priority) => BranchMeta {
                priority: *priority,
                optional: true,
            },
            None => BranchMeta {
                priority: u32::MAX,
                optional: false,
            },
        }
    }
}

impl NodeFactory for TestFactory {
    fn internal(&self, node: &NodeId) -> InternalSpec {
        let escalation = if node.is_root() {
            self.root_policy.clone()
        } else {
            self.inner_policies
                .get(node)
                .cloned()
                .unwrap_or_else(EscalationPolicy::forward_all)
        };
        InternalSpec::new(Arc::clone(&self.combine), escalation)
            .with_overhead(self.overhead)
            .with_meta(self.meta(node))
    }

    fn leaf(&self, node: &NodeId) -> LeafSpec {
        let behavior = self
            .behaviors
            .get(node)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());
        LeafSpec::new(Arc::new(ScriptedCollaborator {
            behavior,
            calls: Arc::clone(&self.calls),
        }))
        .with_meta(self.meta(node))
    }
}

pub fn orchestrator(branching: Vec<u32>, factory: &TestFactory) -> Orchestrator {
    Orchestrator::build(
        &TreeShape::new(branching),
        factory,
        OrchestratorConfig::default(),
    )
    .unwrap()
}

pub async fn run_once(branching: Vec<u32>, factory: &TestFactory) -> RunOutcome {
    orchestrator(branching, factory)
        .run(Request::single(
            json!({ "job": "scan" }),
            Duration::from_secs(10),
            1_000_000,
        ))
        .await
}

/// Messages of every aggregated entry containing `needle`.
pub fn messages_containing(outcome: &RunOutcome, needle: &str) -> Vec<String> {
    outcome
        .aggregated_logs
        .iter()
        .filter(|e| e.message.contains(needle))
        .map(|e| e.message.clone())
        .collect()
}
