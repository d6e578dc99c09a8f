// Engine configuration

use crate::execution::secrets::DEFAULT_MASK;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Maximum jobs running at once across the run
    pub max_parallel_jobs: usize,
    /// Milliseconds per `timeout-minutes` unit
    pub timeout_unit: u64,
    /// Shell for `run` steps without an explicit `shell`
    pub default_shell: String,
    /// Workspace directory. Defaults to the current directory.
    pub working_dir: Option<PathBuf>,
    /// Replacement text for secret values
    pub mask_token: String,
    /// Cancel the whole run as soon as any job fails
    pub cancel_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: default_parallelism(),
            timeout_unit: 60_000,
            default_shell: "bash".to_string(),
            working_dir: None,
            mask_token: DEFAULT_MASK.to_string(),
            cancel_on_failure: false,
        }
    }
}

impl EngineConfig {
    /// Convert a `timeout-minutes` value to a duration
    pub fn timeout(&self, units: f64) -> Duration {
        Duration::from_millis((units.max(0.0) * self.timeout_unit as f64).round() as u64)
    }

    /// The global job limit, never below one
    pub fn parallelism(&self) -> usize {
        self.max_parallel_jobs.max(1)
    }

    pub fn workspace(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.max_parallel_jobs >= 1);
        assert_eq!(config.timeout_unit, 60_000);
        assert_eq!(config.default_shell, "bash");
        assert_eq!(config.mask_token, "***");
        assert!(!config.cancel_on_failure);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: EngineConfig =
            serde_yaml::from_str("max-parallel-jobs: 2\ntimeout-unit: 10\n").unwrap();
        assert_eq!(config.max_parallel_jobs, 2);
        assert_eq!(config.timeout(1.5), Duration::from_millis(15));
        assert_eq!(config.default_shell, "bash");
    }

    #[test]
    fn test_parallelism_floor() {
        let config = EngineConfig {
            max_parallel_jobs: 0,
            ..Default::default()
        };
        assert_eq!(config.parallelism(), 1);
    }
}
