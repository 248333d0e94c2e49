//! Engine configuration types for wfrun.
//!
//! `EngineConfig` represents the `config.toml` in the data directory that
//! controls step concurrency, failure handling and the tick loop.

use serde::{Deserialize, Serialize};

/// What happens to a run when one of its steps fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed step terminates the whole run.
    #[default]
    Terminate,
    /// A failed step only blocks its dependents; the run terminates once no
    /// remaining step can make progress.
    BlockDependents,
}

/// Top-level configuration for the engine.
///
/// Loaded from `~/.wfrun/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on step actions executing concurrently within one tick.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Timeout applied to steps that do not declare one (duration string).
    #[serde(default)]
    pub default_step_timeout: Option<String>,

    /// Tick budget for driving a run until it settles.
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u32,

    /// Pause between consecutive ticks while a step is still in flight.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_max_concurrent_steps() -> usize {
    8
}

fn default_max_ticks() -> u32 {
    1000
}

fn default_tick_interval_ms() -> u64 {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: default_max_concurrent_steps(),
            failure_policy: FailurePolicy::default(),
            default_step_timeout: None,
            max_ticks: default_max_ticks(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_steps, 8);
        assert_eq!(config.failure_policy, FailurePolicy::Terminate);
        assert!(config.default_step_timeout.is_none());
        assert_eq!(config.max_ticks, 1000);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_concurrent_steps, 8);
        assert_eq!(config.tick_interval_ms, 200);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_concurrent_steps = 2
failure_policy = "block_dependents"
default_step_timeout = "10m"
max_ticks = 50
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrent_steps, 2);
        assert_eq!(config.failure_policy, FailurePolicy::BlockDependents);
        assert_eq!(config.default_step_timeout.as_deref(), Some("10m"));
        assert_eq!(config.max_ticks, 50);
        assert_eq!(config.tick_interval_ms, 200);
    }
}
