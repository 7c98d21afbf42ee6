//! Error taxonomy for orchestration runs.
//!
//! Only construction-time defects and the root policy gap are real errors.
//! Collaborator failures, timeouts and budget exhaustion are contained and
//! surface as [`Status`](crate::status::Status) values instead.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::AggregationError;
use crate::envelope::NodeId;

/// Result type alias for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Failure classes a run can encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The wrapped external operation failed at a leaf.
    Collaborator,
    /// A node's deadline elapsed before its children completed.
    Timeout,
    /// Escalation reached the root and the root policy had no answer.
    EscalationUnresolved,
    /// Consumption reached the ceiling despite adaptation.
    BudgetExhausted,
}

impl ErrorKind {
    /// Whether this kind terminates the whole run.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::EscalationUnresolved)
    }

    /// Status reason used when this kind is folded into a [`Status`](crate::status::Status).
    pub fn status_reason(self, detail: &str) -> String {
        match self {
            Self::Collaborator => detail.to_string(),
            Self::Timeout => "timeout".to_string(),
            Self::EscalationUnresolved => format!("policy gap: {}", detail),
            Self::BudgetExhausted => "budget exhausted".to_string(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Collaborator => write!(f, "collaborator_error"),
            Self::Timeout => write!(f, "timeout_error"),
            Self::EscalationUnresolved => write!(f, "escalation_unresolved"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
        }
    }
}

/// Errors that abort construction or a run.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The declarative tree shape cannot be built
    #[error("Invalid tree shape: {message}")]
    InvalidShape { message: String },

    /// Configuration value out of range or unreadable
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The root could not decide an escalation
    #[error("Policy gap for escalation from {origin}: {reason}")]
    PolicyGap { origin: NodeId, reason: String },

    /// IO error wrapper
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A subtree reached aggregation with an escalation still pending
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

impl OrchestratorError {
    /// Create an invalid shape error
    pub fn invalid_shape(message: impl Into<String>) -> Self {
        Self::InvalidShape {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a policy gap error
    pub fn policy_gap(origin: NodeId, reason: impl Into<String>) -> Self {
        Self::PolicyGap {
            origin,
            reason: reason.into(),
        }
    }

    /// Taxonomy kind, if this error belongs to the run-time taxonomy.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::PolicyGap { .. } => Some(ErrorKind::EscalationUnresolved),
            _ => None,
        }
    }
}
