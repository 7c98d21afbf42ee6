//! Orchestrator configuration.
//!
//! Every threshold here is a default, not an invariant. Values come from
//! `Default`, optionally overlaid with `TASKTREE_*` environment variables or
//! read from a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Keep every Nth INFO entry per child during aggregation (1 = keep all).
    pub log_sampling_ratio: usize,
    /// Keep DEBUG entries during aggregation.
    pub verbose: bool,
    /// Projected/ceiling ratio that enters `Warning`.
    pub warning_ratio: f64,
    /// Leaf confidence threshold when the shape does not set one.
    pub default_confidence_threshold: f64,
    /// Each level's deadline is its parent's minus this margin.
    pub dispatch_margin_ms: u64,
    /// Remaining-work multiplier while `reduceSamplingRate` is active.
    pub sampling_reduction_factor: f64,
    /// Remaining-work multiplier while `lowerQualityTarget` is active.
    pub quality_reduction_factor: f64,
    /// Quality boost handed to a leaf re-run after `RetryWithHigherCost`.
    pub retry_cost_multiplier: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            log_sampling_ratio: 10,
            verbose: false,
            warning_ratio: 0.8,
            default_confidence_threshold: 0.7,
            dispatch_margin_ms: 25,
            sampling_reduction_factor: 0.5,
            quality_reduction_factor: 0.75,
            retry_cost_multiplier: 2.0,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `TASKTREE_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_override("TASKTREE_LOG_SAMPLING_RATIO", &mut config.log_sampling_ratio);
        env_override("TASKTREE_VERBOSE", &mut config.verbose);
        env_override("TASKTREE_WARNING_RATIO", &mut config.warning_ratio);
        env_override(
            "TASKTREE_CONFIDENCE_THRESHOLD",
            &mut config.default_confidence_threshold,
        );
        env_override("TASKTREE_DISPATCH_MARGIN_MS", &mut config.dispatch_margin_ms);
        env_override(
            "TASKTREE_SAMPLING_REDUCTION",
            &mut config.sampling_reduction_factor,
        );
        env_override(
            "TASKTREE_QUALITY_REDUCTION",
            &mut config.quality_reduction_factor,
        );
        env_override(
            "TASKTREE_RETRY_COST_MULTIPLIER",
            &mut config.retry_cost_multiplier,
        );
        config
    }

    pub fn from_toml_str(raw: &str) -> OrchestratorResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| OrchestratorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.log_sampling_ratio == 0 {
            return Err(OrchestratorError::config(
                "log_sampling_ratio must be at least 1",
            ));
        }
        if !(self.warning_ratio > 0.0 && self.warning_ratio <= 1.0) {
            return Err(OrchestratorError::config(format!(
                "warning_ratio ({}) must be in (0, 1]",
                self.warning_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.default_confidence_threshold) {
            return Err(OrchestratorError::config(format!(
                "default_confidence_threshold ({}) must be in [0, 1]",
                self.default_confidence_threshold
            )));
        }
        for (name, factor) in [
            ("sampling_reduction_factor", self.sampling_reduction_factor),
            ("quality_reduction_factor", self.quality_reduction_factor),
        ] {
            if !(factor > 0.0 && factor <= 1.0) {
                return Err(OrchestratorError::config(format!(
                    "{} ({}) must be in (0, 1]",
                    name, factor
                )));
            }
        }
        if self.dispatch_margin_ms == 0 {
            return Err(OrchestratorError::config(
                "dispatch_margin_ms must be at least 1 so each level finishes before its parent",
            ));
        }
        if self.retry_cost_multiplier < 1.0 {
            return Err(OrchestratorError::config(format!(
                "retry_cost_multiplier ({}) must be at least 1.0",
                self.retry_cost_multiplier
            )));
        }
        Ok(())
    }

    pub fn dispatch_margin(&self) -> Duration {
        Duration::from_millis(self.dispatch_margin_ms)
    }
}

fn env_override<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.log_sampling_ratio, 10);
        assert_eq!(config.dispatch_margin(), Duration::from_millis(25));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OrchestratorConfig::from_toml_str("log_sampling_ratio = 4\nverbose = true").unwrap();
        assert_eq!(config.log_sampling_ratio, 4);
        assert!(config.verbose);
        assert_eq!(config.warning_ratio, 0.8);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = OrchestratorConfig::default();
        config.log_sampling_ratio = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.warning_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.sampling_reduction_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.retry_cost_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.dispatch_margin_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatch_margin_ms"));
    }

    #[test]
    fn test_toml_rejects_invalid() {
        let err = OrchestratorConfig::from_toml_str("warning_ratio = 0.0").unwrap_err();
        assert!(matches!(err, OrchestratorError::Config { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasktree.toml");
        std::fs::write(&path, "dispatch_margin_ms = 5\n").unwrap();
        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.dispatch_margin_ms, 5);
    }

    #[test]
    fn test_load_missing_file() {
        let err = OrchestratorConfig::load("/nonexistent/tasktree.toml").unwrap_err();
        assert!(matches!(err, OrchestratorError::Io { .. }));
    }
}
