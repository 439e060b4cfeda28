use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level settings for the upgrade coordinator and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// SQLite file to upgrade. The CLI `--database` flag overrides it.
    pub database_path: Option<PathBuf>,
    pub lease: LeaseConfig,
    /// Threads in the coordinator's worker pool.
    pub worker_threads: usize,
    /// Pause after a run finishes so trailing progress output is flushed.
    pub drain_delay_ms: u64,
    /// Minimum spacing between progress lines emitted by long row loops.
    pub progress_log_interval_secs: u64,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            lease: LeaseConfig::default(),
            worker_threads: 2,
            drain_delay_ms: 500,
            progress_log_interval_secs: 10,
        }
    }
}

impl UpgradeConfig {
    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_secs(self.progress_log_interval_secs)
    }
}

/// Timing of the upgrade lease.
///
/// A freshly acquired lease lives `initial_secs` until its run actually
/// starts. Starting and every heartbeat push the expiry `renewal_secs`
/// ahead, but never beyond `max_total_secs` after acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub initial_secs: u64,
    pub renewal_secs: u64,
    pub max_total_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            initial_secs: 5,
            renewal_secs: 60,
            max_total_secs: 30 * 60,
        }
    }
}

impl LeaseConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_secs(self.initial_secs)
    }

    pub fn renewal(&self) -> Duration {
        Duration::from_secs(self.renewal_secs)
    }

    pub fn max_total(&self) -> Duration {
        Duration::from_secs(self.max_total_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: UpgradeConfig = serde_yaml::from_str("worker_threads: 4\nlease:\n  renewal_secs: 90\n").unwrap();
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.lease.renewal_secs, 90);
        assert_eq!(config.lease.initial_secs, 5);
        assert_eq!(config.drain_delay_ms, 500);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn durations_follow_fields() {
        let config = UpgradeConfig::default();
        assert_eq!(config.lease.max_total(), Duration::from_secs(1800));
        assert_eq!(config.drain_delay(), Duration::from_millis(500));
        assert_eq!(config.progress_log_interval(), Duration::from_secs(10));
    }
}
