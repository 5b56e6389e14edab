//! Orchestration defaults.
//!
//! Timeouts, retry caps, and the recovery window are loaded from a YAML
//! file at startup or fall back to built-in defaults. Every suspension
//! point in the engine carries one of these bounds.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Orchestration configuration with bounded defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Seconds a blocking rendezvous `wait` may hold before the request is
    /// cancelled with `reason = timeout`.
    #[serde(default = "default_ui_wait_timeout_secs")]
    pub ui_wait_timeout_secs: u64,
    /// Retry cap per subtask before the failure policy forces `fail_task`
    /// or `escalate_to_user`.
    #[serde(default = "default_max_subtask_retries")]
    pub max_subtask_retries: u32,
    /// Cap on needs-input rounds per subtask before it is failed.
    #[serde(default = "default_max_needs_input_rounds")]
    pub max_needs_input_rounds: u32,
    /// Cap on delegation hops per subtask.
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: u32,
    /// Seconds since last update beyond which an in-flight task is not
    /// recovered and is marked failed with `reason = recovery_timeout`.
    #[serde(default = "default_recovery_window_secs")]
    pub recovery_window_secs: u64,
    /// Base backoff between local subtask retries, milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Sampling temperature used for planning completions.
    #[serde(default = "default_planning_temperature")]
    pub planning_temperature: f32,
}

fn default_ui_wait_timeout_secs() -> u64 {
    900
}
fn default_max_subtask_retries() -> u32 {
    3
}
fn default_max_needs_input_rounds() -> u32 {
    8
}
fn default_max_delegation_depth() -> u32 {
    3
}
fn default_recovery_window_secs() -> u64 {
    86_400
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_planning_temperature() -> f32 {
    0.2
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            ui_wait_timeout_secs: default_ui_wait_timeout_secs(),
            max_subtask_retries: default_max_subtask_retries(),
            max_needs_input_rounds: default_max_needs_input_rounds(),
            max_delegation_depth: default_max_delegation_depth(),
            recovery_window_secs: default_recovery_window_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            planning_temperature: default_planning_temperature(),
        }
    }
}

impl OrchestrationConfig {
    /// Load configuration from a YAML file; absent keys keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// UI wait bound as a [`Duration`].
    pub fn ui_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.ui_wait_timeout_secs)
    }

    /// Recovery window as a [`Duration`].
    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_secs)
    }

    /// Base retry backoff as a [`Duration`].
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_bounded() {
        let config = OrchestrationConfig::default();
        assert!(config.ui_wait_timeout() > Duration::ZERO);
        assert!(config.recovery_window() > Duration::ZERO);
        assert!(config.max_subtask_retries > 0);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: OrchestrationConfig =
            serde_yaml::from_str("max_subtask_retries: 7\n").unwrap();
        assert_eq!(config.max_subtask_retries, 7);
        assert_eq!(config.ui_wait_timeout_secs, default_ui_wait_timeout_secs());
    }
}
