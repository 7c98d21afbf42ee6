//! Demo tree: a media-analysis pipeline of simulated detectors.
//!
//! The shape, per-depth node metadata and detector behavior come from a TOML
//! file. Detectors are deterministic: cost, confidence, failures and latency
//! are all keyed on the leaf's index, so repeated runs produce the same
//! outcome.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tasktree::escalation::{accept_default, always, confidence_floor, unresolved};
use tasktree::{
    combine, BranchMeta, Choice, Collaborator, CollaboratorError, Combiner, EscalationPolicy,
    EscalationReason, InternalSpec, Invocation, LeafCall, LeafSpec, NodeFactory, NodeId,
    OrchestratorConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineKind {
    CollectArray,
    KeyedObject,
    MeanScore,
    FirstSuccess,
}

impl CombineKind {
    fn combiner(self) -> Combiner {
        match self {
            Self::CollectArray => combine::collect_array(),
            Self::KeyedObject => combine::keyed_object(),
            Self::MeanScore => combine::mean_score("score"),
            Self::FirstSuccess => combine::first_success(),
        }
    }
}

/// How the root answers escalations that reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootResolver {
    AcceptDefault,
    Retry,
    Flag,
    ConfidenceFloor,
    /// No rule at all; any escalation reaching the root aborts the run.
    Unresolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    pub resolver: RootResolver,
    /// Used by `confidence_floor`.
    pub review_floor: f64,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            resolver: RootResolver::ConfidenceFloor,
            review_floor: 0.6,
        }
    }
}

/// Metadata for every node at one depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    /// Degradation priority by sibling index; missing entries use the index.
    pub priority: Vec<u32>,
    pub optional: bool,
    pub overhead: u64,
    /// Escalation reasons internal nodes at this depth decide themselves.
    pub local_reasons: Vec<EscalationReason>,
    pub combine: CombineKind,
    /// Leaf threshold at this depth; the orchestrator default otherwise.
    pub confidence_threshold: Option<f64>,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            priority: Vec::new(),
            optional: false,
            overhead: 1,
            local_reasons: Vec::new(),
            combine: CombineKind::MeanScore,
            confidence_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub base_units: u64,
    pub latency_ms: u64,
    /// Every Nth detector fails (0 disables).
    pub fail_every: u64,
    /// Every Nth detector reports `unsure_confidence` (0 disables).
    pub unsure_every: u64,
    pub unsure_confidence: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            base_units: 10,
            latency_ms: 5,
            fail_every: 7,
            unsure_every: 5,
            unsure_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub branching: Vec<u32>,
    /// Indexed by depth; the root is depth 0.
    pub levels: Vec<LevelConfig>,
    pub root: RootConfig,
    pub detector: DetectorConfig,
    /// Falls back to `OrchestratorConfig::from_env()` when absent.
    pub orchestrator: Option<OrchestratorConfig>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            branching: vec![3, 2, 2],
            levels: vec![
                LevelConfig {
                    overhead: 2,
                    ..LevelConfig::default()
                },
                LevelConfig {
                    priority: vec![3, 1, 2],
                    optional: true,
                    ..LevelConfig::default()
                },
                LevelConfig::default(),
                LevelConfig::default(),
            ],
            root: RootConfig::default(),
            detector: DetectorConfig::default(),
            orchestrator: None,
        }
    }
}

impl DemoConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("invalid demo configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("failed to load {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.levels.first().is_some_and(|root| root.optional) {
            anyhow::bail!("the root level cannot be optional");
        }
        if !(0.0..=1.0).contains(&self.detector.unsure_confidence) {
            anyhow::bail!(
                "unsure_confidence ({}) must be in [0, 1]",
                self.detector.unsure_confidence
            );
        }
        if let Some(config) = &self.orchestrator {
            config.validate()?;
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        self.orchestrator
            .clone()
            .unwrap_or_else(OrchestratorConfig::from_env)
    }

    fn level(&self, depth: usize) -> LevelConfig {
        self.levels.get(depth).cloned().unwrap_or_default()
    }

    fn root_policy(&self) -> EscalationPolicy {
        let resolver = match self.root.resolver {
            RootResolver::AcceptDefault => accept_default(),
            RootResolver::Retry => always(Choice::RetryWithHigherCost),
            RootResolver::Flag => always(Choice::FlagForReview),
            RootResolver::ConfidenceFloor => confidence_floor(self.root.review_floor),
            RootResolver::Unresolved => unresolved(),
        };
        EscalationPolicy::decide_all(resolver)
    }
}

/// Ordinal of a leaf among all leaves, in sibling order.
pub fn leaf_index(id: &NodeId, branching: &[u32]) -> u64 {
    id.path()
        .iter()
        .zip(branching)
        .fold(0u64, |acc, (step, width)| {
            acc * u64::from(*width) + u64::from(*step)
        })
}

/// A deterministic stand-in for a media detector.
pub struct SimulatedDetector {
    name: String,
    index: u64,
    config: DetectorConfig,
}

impl SimulatedDetector {
    pub fn new(index: u64, config: DetectorConfig) -> Self {
        Self {
            name: format!("detector-{}", index),
            index,
            config,
        }
    }

    fn is_every(&self, n: u64) -> bool {
        n > 0 && (self.index + 1) % n == 0
    }

    fn units(&self, call: &LeafCall) -> u64 {
        let mut units = (self.config.base_units + self.index % 4) as f64;
        if call.degradation.reduced_sampling {
            units *= 0.5;
        }
        if call.degradation.lowered_quality {
            units *= 0.75;
        }
        (units * call.quality_boost).round() as u64
    }

    fn confidence(&self, call: &LeafCall) -> f64 {
        let base = if self.is_every(self.config.unsure_every) {
            self.config.unsure_confidence
        } else {
            0.9 - (self.index % 5) as f64 * 0.02
        };
        (base * call.quality_boost).min(1.0)
    }
}

#[async_trait]
impl Collaborator for SimulatedDetector {
    async fn invoke(&self, call: &LeafCall) -> Result<Invocation, CollaboratorError> {
        let latency = self.config.latency_ms * (1 + self.index % 3);
        tokio::time::sleep(Duration::from_millis(latency)).await;

        if self.is_every(self.config.fail_every) {
            return Err(
                CollaboratorError::new(format!("{} unavailable", self.name)).with_units(1)
            );
        }

        let confidence = self.confidence(call);
        let value = json!({
            "detector": self.name,
            "score": confidence,
            "weight": 1.0,
            "batch": call.payload.get("batch").cloned().unwrap_or_default(),
        });
        Ok(Invocation::new(value, confidence, self.units(call)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct DemoFactory {
    config: DemoConfig,
}

impl DemoFactory {
    pub fn new(config: DemoConfig) -> Self {
        Self { config }
    }

    fn meta(&self, id: &NodeId) -> BranchMeta {
        let level = self.config.level(id.depth());
        let index = id.sibling_index();
        BranchMeta {
            priority: level.priority.get(index as usize).copied().unwrap_or(index),
            optional: level.optional && !id.is_root(),
        }
    }
}

impl NodeFactory for DemoFactory {
    fn internal(&self, id: &NodeId) -> InternalSpec {
        let level = self.config.level(id.depth());
        let escalation = if id.is_root() {
            self.config.root_policy()
        } else if level.local_reasons.is_empty() {
            EscalationPolicy::forward_all()
        } else {
            EscalationPolicy::local_reasons(level.local_reasons.clone(), accept_default())
        };
        InternalSpec::new(level.combine.combiner(), escalation)
            .with_overhead(level.overhead)
            .with_meta(self.meta(id))
    }

    fn leaf(&self, id: &NodeId) -> LeafSpec {
        let level = self.config.level(id.depth());
        let detector = SimulatedDetector::new(
            leaf_index(id, &self.config.branching),
            self.config.detector.clone(),
        );
        let spec = LeafSpec::new(Arc::new(detector)).with_meta(self.meta(id));
        match level.confidence_threshold {
            Some(threshold) => spec.with_threshold(threshold),
            None => spec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasktree::{Orchestrator, OutcomeKind, Request, TreeShape};

    fn call(node: &NodeId) -> LeafCall {
        LeafCall {
            node: node.clone(),
            payload: json!({ "batch": 0 }),
            cycle: 0,
            degradation: Default::default(),
            budget_hint: 0,
            quality_boost: 1.0,
        }
    }

    #[test]
    fn test_leaf_index_is_mixed_radix() {
        let branching = [3, 2, 2];
        assert_eq!(leaf_index(&NodeId::from_path(vec![0, 0, 0]), &branching), 0);
        assert_eq!(leaf_index(&NodeId::from_path(vec![1, 0, 1]), &branching), 5);
        assert_eq!(leaf_index(&NodeId::from_path(vec![2, 1, 1]), &branching), 11);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = DemoConfig::from_toml_str(
            r#"
            branching = [2, 4]

            [root]
            resolver = "retry"

            [[levels]]
            overhead = 0

            [[levels]]
            optional = true
            priority = [9, 1]
            local_reasons = ["low_confidence"]

            [detector]
            fail_every = 0

            [orchestrator]
            log_sampling_ratio = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.branching, vec![2, 4]);
        assert_eq!(config.root.resolver, RootResolver::Retry);
        assert_eq!(config.levels[1].local_reasons, vec![EscalationReason::LowConfidence]);
        assert_eq!(config.detector.base_units, 10);
        assert_eq!(config.orchestrator_config().log_sampling_ratio, 1);
    }

    #[test]
    fn test_bundled_demo_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demo.toml");
        let config = DemoConfig::load(&path).unwrap();
        assert_eq!(config.branching, vec![2, 3, 2]);
        assert_eq!(config.levels.len(), 4);
        assert_eq!(config.levels[0].combine, CombineKind::KeyedObject);
        assert_eq!(config.levels[3].confidence_threshold, Some(0.75));
        assert_eq!(config.orchestrator_config().dispatch_margin_ms, 20);
    }

    #[test]
    fn test_missing_file_names_the_path() {
        let err = DemoConfig::load(Path::new("/nonexistent/demo.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/demo.toml"));
    }

    #[test]
    fn test_rejects_optional_root() {
        let err = DemoConfig::from_toml_str("[[levels]]\noptional = true\n").unwrap_err();
        assert!(err.to_string().contains("root level"));
    }

    #[test]
    fn test_priority_by_sibling_index() {
        let factory = DemoFactory::new(DemoConfig::default());
        let meta = factory.meta(&NodeId::from_path(vec![1]));
        assert!(meta.optional);
        assert_eq!(meta.priority, 1);
        assert!(!factory.meta(&NodeId::root()).optional);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_is_deterministic() {
        let detector = SimulatedDetector::new(4, DetectorConfig::default());
        let node = NodeId::from_path(vec![1, 0, 0]);

        let first = detector.invoke(&call(&node)).await.unwrap();
        let second = detector.invoke(&call(&node)).await.unwrap();
        assert_eq!(first, second);
        // index 4 is every 5th
        assert_eq!(first.confidence, 0.5);
        assert_eq!(first.units_consumed, 10);

        let boosted = detector
            .invoke(&LeafCall {
                quality_boost: 2.0,
                ..call(&node)
            })
            .await
            .unwrap();
        assert_eq!(boosted.confidence, 1.0);
        assert_eq!(boosted.units_consumed, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_failure_counts_units() {
        let detector = SimulatedDetector::new(6, DetectorConfig::default());
        let err = detector
            .invoke(&call(&NodeId::from_path(vec![1, 1, 0])))
            .await
            .unwrap_err();
        assert_eq!(err.units_consumed, 1);
        assert!(err.message.contains("detector-6"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_demo_runs() {
        let demo = DemoConfig {
            orchestrator: Some(OrchestratorConfig::default()),
            ..DemoConfig::default()
        };
        let factory = DemoFactory::new(demo.clone());
        let orchestrator = Orchestrator::build(
            &TreeShape::new(demo.branching.clone()),
            &factory,
            demo.orchestrator_config(),
        )
        .unwrap();
        let outcome = orchestrator
            .run(Request::single(
                json!({ "batch": 0 }),
                Duration::from_secs(5),
                10_000,
            ))
            .await;

        assert_eq!(outcome.kind, OutcomeKind::Completed);
        // detector 6 fails; detectors 4 and 9 escalate and get flagged
        assert!(outcome.final_status.is_degraded());
        assert_eq!(outcome.escalation_audit.len(), 2);
        assert!(outcome
            .escalation_audit
            .iter()
            .all(|a| a.chosen == Choice::FlagForReview));
        assert!(outcome.final_value.unwrap().get("score").is_some());
    }
}
