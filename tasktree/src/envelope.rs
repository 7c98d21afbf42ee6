//! Node identity, run log records, resource cost and the result envelope
//! that every node hands back to its parent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::escalation::{EscalationAudit, EscalationRequest};
use crate::status::Status;

/// Stable identifier of a tree vertex: the sibling indices on the path from
/// the root. The root has an empty path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId {
    path: Vec<u32>,
}

impl NodeId {
    pub fn root() -> Self {
        Self { path: Vec::new() }
    }

    pub fn from_path(path: Vec<u32>) -> Self {
        Self { path }
    }

    /// Id of this node's `index`-th child.
    pub fn child(&self, index: u32) -> Self {
        let mut path = self.path.clone();
        path.push(index);
        Self { path }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.path.is_empty() {
            return None;
        }
        Some(Self {
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Index among siblings (0 for the root).
    pub fn sibling_index(&self) -> u32 {
        self.path.last().copied().unwrap_or(0)
    }

    pub fn path(&self) -> &[u32] {
        &self.path
    }

    /// Strict ancestor test (a node is not its own ancestor).
    pub fn is_ancestor_of(&self, other: &NodeId) -> bool {
        self.path.len() < other.path.len() && other.path.starts_with(&self.path)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            return write!(f, "root");
        }
        let parts: Vec<String> = self.path.iter().map(|i| i.to_string()).collect();
        write!(f, "n{}", parts.join("."))
    }
}

/// Severity of a run log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// A single append-only run log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub node: NodeId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, node: &NodeId, message: impl Into<String>) -> Self {
        Self {
            level,
            node: node.clone(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn debug(node: &NodeId, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, node, message)
    }

    pub fn info(node: &NodeId, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, node, message)
    }

    pub fn warn(node: &NodeId, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, node, message)
    }

    pub fn error(node: &NodeId, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, node, message)
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:<5} [{}] {}",
            self.timestamp.to_rfc3339(),
            self.level,
            self.node,
            self.message
        )
    }
}

/// Resource units consumed. Aggregation is pure summation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ResourceCost {
    pub units_consumed: u64,
}

impl ResourceCost {
    pub fn new(units_consumed: u64) -> Self {
        Self { units_consumed }
    }

    pub fn zero() -> Self {
        Self::default()
    }
}

impl std::ops::Add for ResourceCost {
    type Output = ResourceCost;

    fn add(self, rhs: ResourceCost) -> ResourceCost {
        ResourceCost {
            units_consumed: self.units_consumed.saturating_add(rhs.units_consumed),
        }
    }
}

impl std::ops::AddAssign for ResourceCost {
    fn add_assign(&mut self, rhs: ResourceCost) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for ResourceCost {
    fn sum<I: Iterator<Item = ResourceCost>>(iter: I) -> Self {
        iter.fold(ResourceCost::zero(), |acc, c| acc + c)
    }
}

/// Output of one node's execution.
///
/// Created fresh at each leaf and replaced (never mutated in place) by each
/// parent with the aggregated version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Node that produced this envelope.
    pub node: NodeId,
    pub value: Value,
    pub status: Status,
    pub logs: Vec<LogEntry>,
    pub cost: ResourceCost,
    /// Set when the producer could not choose among its options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationRequest>,
    /// Resolved escalations within this subtree, in sibling order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit: Vec<EscalationAudit>,
}

impl ResultEnvelope {
    /// A healthy envelope carrying `value`.
    pub fn healthy(node: &NodeId, value: Value, cost: ResourceCost) -> Self {
        Self {
            node: node.clone(),
            value,
            status: Status::Healthy,
            logs: Vec::new(),
            cost,
            escalation: None,
            audit: Vec::new(),
        }
    }

    /// A failed envelope with a null value.
    pub fn failed(node: &NodeId, reason: impl Into<String>, cost: ResourceCost) -> Self {
        Self {
            node: node.clone(),
            value: Value::Null,
            status: Status::Failed(reason.into()),
            logs: Vec::new(),
            cost,
            escalation: None,
            audit: Vec::new(),
        }
    }

    pub fn with_log(mut self, entry: LogEntry) -> Self {
        self.logs.push(entry);
        self
    }

    pub fn with_escalation(mut self, request: EscalationRequest) -> Self {
        self.escalation = Some(request);
        self
    }

    pub fn needs_escalation(&self) -> bool {
        self.escalation.is_some()
    }
}
