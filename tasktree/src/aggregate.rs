//! Aggregation Engine: merges child results into one envelope.
//!
//! Reduction rules, shared by every internal node:
//! - status: worst wins, except that a failed child only degrades its
//!   parent unless every child failed
//! - value: node-supplied [`Combiner`] over non-failed children, in sibling order
//! - logs: per-child filter (ERROR/WARN always, every Nth INFO, DEBUG only
//!   when verbose), then concatenation in sibling order
//! - cost: own overhead plus the sum of children

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::OrchestratorConfig;
use crate::envelope::{LogEntry, LogLevel, NodeId, ResourceCost, ResultEnvelope};
use crate::status::Status;

/// A child's contribution as seen by a combiner.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildValue {
    pub node: NodeId,
    pub value: Value,
}

/// Domain-specific combination of child values, in sibling order.
pub type Combiner = Arc<dyn Fn(&[ChildValue]) -> Value + Send + Sync>;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Child {child} still carries an unresolved escalation from {origin}")]
    UnresolvedEscalation { child: NodeId, origin: NodeId },
}

/// Per-child log reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFilter {
    /// Keep every Nth INFO entry (1 keeps all).
    pub sampling_ratio: usize,
    pub verbose: bool,
}

impl LogFilter {
    pub fn new(sampling_ratio: usize, verbose: bool) -> Self {
        Self {
            sampling_ratio: sampling_ratio.max(1),
            verbose,
        }
    }

    /// Keep ERROR/WARN, the INFO entries whose INFO-index is a multiple of
    /// the ratio, and DEBUG only when verbose. Order is preserved.
    pub fn filter(&self, entries: &[LogEntry]) -> Vec<LogEntry> {
        let mut info_seen = 0usize;
        entries
            .iter()
            .filter(|entry| match entry.level {
                LogLevel::Error | LogLevel::Warn => true,
                LogLevel::Info => {
                    let keep = info_seen % self.sampling_ratio == 0;
                    info_seen += 1;
                    keep
                }
                LogLevel::Debug => self.verbose,
            })
            .cloned()
            .collect()
    }
}

impl Default for LogFilter {
    fn default() -> Self {
        Self::new(10, false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregationEngine {
    filter: LogFilter,
}

impl AggregationEngine {
    pub fn new(filter: LogFilter) -> Self {
        Self { filter }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(LogFilter::new(config.log_sampling_ratio, config.verbose))
    }

    pub fn filter(&self) -> &LogFilter {
        &self.filter
    }

    /// Merge `children` into the envelope for `node`.
    ///
    /// Children are put in sibling order first, so the result does not depend
    /// on completion order. `own_logs` are appended after the children's.
    pub fn aggregate(
        &self,
        node: &NodeId,
        mut children: Vec<ResultEnvelope>,
        overhead: ResourceCost,
        combine: &Combiner,
        own_logs: Vec<LogEntry>,
    ) -> Result<ResultEnvelope, AggregationError> {
        if let Some(pending) = children.iter().find(|c| c.escalation.is_some()) {
            let origin = pending
                .escalation
                .as_ref()
                .map(|e| e.origin.clone())
                .unwrap_or_else(|| pending.node.clone());
            return Err(AggregationError::UnresolvedEscalation {
                child: pending.node.clone(),
                origin,
            });
        }

        children.sort_by(|a, b| a.node.cmp(&b.node));

        let status = reduce_status(&children);
        let cost = overhead + children.iter().map(|c| c.cost).sum::<ResourceCost>();

        let values: Vec<ChildValue> = children
            .iter()
            .filter(|c| !c.status.is_failed())
            .map(|c| ChildValue {
                node: c.node.clone(),
                value: c.value.clone(),
            })
            .collect();
        let value = combine(&values);

        let mut logs = Vec::new();
        let mut audit = Vec::new();
        for child in children {
            logs.extend(self.filter.filter(&child.logs));
            audit.extend(child.audit);
        }
        logs.extend(own_logs);

        Ok(ResultEnvelope {
            node: node.clone(),
            value,
            status,
            logs,
            cost,
            escalation: None,
            audit,
        })
    }
}

/// Worst-status-wins with graceful degradation.
///
/// `Failed` iff every child failed; `Degraded` iff any child failed or is
/// degraded; otherwise `Healthy`. Reasons list child ids in sorted order.
pub fn reduce_status(children: &[ResultEnvelope]) -> Status {
    if children.is_empty() {
        return Status::Healthy;
    }

    let mut failed: Vec<&NodeId> = children
        .iter()
        .filter(|c| c.status.is_failed())
        .map(|c| &c.node)
        .collect();
    if failed.len() == children.len() {
        return Status::failed("all children failed");
    }
    if !failed.is_empty() {
        failed.sort();
        return Status::degraded(format!("child failure: {}", join_ids(&failed)));
    }

    let mut degraded: Vec<&NodeId> = children
        .iter()
        .filter(|c| c.status.is_degraded())
        .map(|c| &c.node)
        .collect();
    if !degraded.is_empty() {
        degraded.sort();
        return Status::degraded(format!("child degraded: {}", join_ids(&degraded)));
    }

    Status::Healthy
}

fn join_ids(ids: &[&NodeId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Stock combiners.
pub mod combine {
    use super::*;

    /// JSON array of child values.
    pub fn collect_array() -> Combiner {
        Arc::new(|children| Value::Array(children.iter().map(|c| c.value.clone()).collect()))
    }

    /// JSON object keyed by child id.
    pub fn keyed_object() -> Combiner {
        Arc::new(|children| {
            let map: Map<String, Value> = children
                .iter()
                .map(|c| (c.node.to_string(), c.value.clone()))
                .collect();
            Value::Object(map)
        })
    }

    /// Weighted mean of `value[field]`, weighted by `value["weight"]`
    /// (default 1). Produces `{field: mean, "weight": total}` so it nests.
    pub fn mean_score(field: &str) -> Combiner {
        let field = field.to_string();
        Arc::new(move |children| {
            let mut total = 0.0;
            let mut weight = 0.0;
            for child in children {
                let Some(score) = child.value.get(&field).and_then(Value::as_f64) else {
                    continue;
                };
                let w = child
                    .value
                    .get("weight")
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0);
                total += score * w;
                weight += w;
            }
            if weight <= 0.0 {
                return Value::Null;
            }
            let mut map = Map::new();
            map.insert(field.clone(), Value::from(total / weight));
            map.insert("weight".to_string(), Value::from(weight));
            Value::Object(map)
        })
    }

    /// The first non-null child value.
    pub fn first_success() -> Combiner {
        Arc::new(|children| {
            children
                .iter()
                .find(|c| !c.value.is_null())
                .map(|c| c.value.clone())
                .unwrap_or(Value::Null)
        })
    }
}
