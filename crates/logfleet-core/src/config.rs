// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for logfleet-core.

use std::time::Duration;

/// Orchestrator configuration loaded from environment variables.
///
/// The persistence backend and remote executor are constructed by the
/// embedding application and handed to the runtime builder directly, so no
/// connection strings or credentials appear here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory under which instance deploy paths are created when the
    /// operator does not supply a custom path.
    pub deploy_base_dir: String,
    /// Local path of the shipper package tarball uploaded during initialize.
    pub package_path: String,
    /// Maximum number of task bodies executing concurrently.
    pub max_concurrent_tasks: usize,
    /// How often the liveness reconciler sweeps instances with a recorded PID.
    pub reconciler_interval: Duration,
    /// Instances whose state changed more recently than this are skipped by
    /// the reconciler. Must exceed the longest expected start-up settling time.
    pub reconciler_grace_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deploy_base_dir: "/opt/logfleet".to_string(),
            package_path: "/opt/logfleet/packages/shipper.tar.gz".to_string(),
            max_concurrent_tasks: 8,
            reconciler_interval: Duration::from_millis(600_000),
            reconciler_grace_window: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `LOGFLEET_DEPLOY_BASE_DIR` | `/opt/logfleet` |
    /// | `LOGFLEET_PACKAGE_PATH` | `/opt/logfleet/packages/shipper.tar.gz` |
    /// | `LOGFLEET_MAX_CONCURRENT_TASKS` | `8` |
    /// | `LOGFLEET_RECONCILER_INTERVAL_MS` | `600000` |
    /// | `LOGFLEET_RECONCILER_GRACE_MS` | `300000` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let deploy_base_dir = std::env::var("LOGFLEET_DEPLOY_BASE_DIR")
            .unwrap_or(defaults.deploy_base_dir);

        let package_path =
            std::env::var("LOGFLEET_PACKAGE_PATH").unwrap_or(defaults.package_path);

        let max_concurrent_tasks = match std::env::var("LOGFLEET_MAX_CONCURRENT_TASKS") {
            Ok(v) => v
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidNumber("LOGFLEET_MAX_CONCURRENT_TASKS"))?,
            Err(_) => defaults.max_concurrent_tasks,
        };

        let reconciler_interval = match std::env::var("LOGFLEET_RECONCILER_INTERVAL_MS") {
            Ok(v) => Duration::from_millis(
                v.parse::<u64>()
                    .map_err(|_| ConfigError::InvalidNumber("LOGFLEET_RECONCILER_INTERVAL_MS"))?,
            ),
            Err(_) => defaults.reconciler_interval,
        };

        let reconciler_grace_window = match std::env::var("LOGFLEET_RECONCILER_GRACE_MS") {
            Ok(v) => Duration::from_millis(
                v.parse::<u64>()
                    .map_err(|_| ConfigError::InvalidNumber("LOGFLEET_RECONCILER_GRACE_MS"))?,
            ),
            Err(_) => defaults.reconciler_grace_window,
        };

        Ok(Self {
            deploy_base_dir,
            package_path,
            max_concurrent_tasks,
            reconciler_interval,
            reconciler_grace_window,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value that does not parse as a
    /// positive number.
    #[error("Invalid numeric value for {0}")]
    InvalidNumber(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.deploy_base_dir, "/opt/logfleet");
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.reconciler_interval, Duration::from_millis(600_000));
        assert_eq!(config.reconciler_grace_window, Duration::from_secs(300));
    }

    #[test]
    fn test_grace_window_shorter_than_interval() {
        // The default grace window must sit inside the default sweep interval,
        // otherwise freshly started instances would be probed on their first sweep.
        let config = Config::default();
        assert!(config.reconciler_grace_window < config.reconciler_interval);
    }
}
