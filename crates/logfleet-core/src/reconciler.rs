// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for detecting and healing externally-dead instances.
//!
//! Instances recorded as RUNNING (or STOP_FAILED) can die without the
//! orchestrator hearing about it: the process crashes, someone kills it by
//! hand, the machine reboots. Each sweep probes the recorded PID of such
//! instances over the remote executor and, when the process is confirmed
//! gone, atomically clears the PID and resets the state to NOT_STARTED - as
//! if the instance had been cleanly stopped.
//!
//! The reconciler is deliberately conservative:
//! - instances whose state changed inside the grace window are skipped, so a
//!   shipper that is still settling after start is never probed;
//! - a probe that fails (host unreachable) is treated as "still alive" - a
//!   transient network problem must not reset a healthy instance;
//! - errors are contained per instance, and a sweep can never take down the
//!   scheduling loop.
//!
//! Transient states (INITIALIZING, STARTING, STOPPING) are never touched;
//! an instance stranded there by a crash is an operator decision, visible
//! through task status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::persistence::{InstanceRecord, Persistence};
use crate::remote::RemoteExecutor;
use crate::state::InstanceState;

/// Configuration for the liveness reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to sweep instances with a recorded PID.
    pub poll_interval: Duration,
    /// Instances whose state changed more recently than this are skipped.
    ///
    /// Must exceed the longest expected start-up settling time, otherwise a
    /// freshly started shipper whose PID file lags can be reset as a false
    /// positive.
    pub grace_window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(600_000),
            grace_window: Duration::from_secs(300),
        }
    }
}

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Instances probed.
    pub checked: usize,
    /// Instances skipped (wrong state or inside the grace window).
    pub skipped: usize,
    /// Instances confirmed dead and reset to NOT_STARTED.
    pub healed: usize,
    /// Instances whose probe or reset errored (left untouched).
    pub errors: usize,
}

/// Background worker that reconciles recorded state with remote liveness.
pub struct Reconciler {
    persistence: Arc<dyn Persistence>,
    remote: Arc<dyn RemoteExecutor>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        remote: Arc<dyn RemoteExecutor>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            persistence,
            remote,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            grace_window_secs = self.config.grace_window.as_secs(),
            "liveness reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("liveness reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let stats = self.sweep().await;
                    debug!(
                        checked = stats.checked,
                        skipped = stats.skipped,
                        healed = stats.healed,
                        errors = stats.errors,
                        "reconciler sweep finished"
                    );
                }
            }
        }

        info!("liveness reconciler stopped");
    }

    /// Run one sweep over all instances carrying a recorded PID.
    ///
    /// Every per-instance failure is caught and counted; the sweep always
    /// runs to the end of the list.
    pub async fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        let instances = match self.persistence.list_instances_with_pid().await {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, "reconciler could not list instances");
                stats.errors += 1;
                return stats;
            }
        };

        if instances.is_empty() {
            debug!("no instances with a recorded PID");
            return stats;
        }

        for instance in instances {
            if !self.should_check(&instance) {
                stats.skipped += 1;
                continue;
            }
            stats.checked += 1;
            match self.check_instance(&instance).await {
                Ok(true) => stats.healed += 1,
                Ok(false) => {}
                Err(e) => {
                    // Contained: one bad instance never aborts the sweep.
                    error!(instance_id = instance.id, error = %e, "reconciler check failed");
                    stats.errors += 1;
                }
            }
        }

        stats
    }

    /// Only RUNNING/STOP_FAILED instances outside the grace window are probed.
    fn should_check(&self, instance: &InstanceRecord) -> bool {
        match InstanceState::parse(&instance.state) {
            Some(InstanceState::Running) | Some(InstanceState::StopFailed) => {}
            _ => {
                debug!(
                    instance_id = instance.id,
                    state = %instance.state,
                    "skipping instance in non-reconciled state"
                );
                return false;
            }
        }

        let age = Utc::now().signed_duration_since(instance.state_changed_at);
        let grace = chrono::Duration::from_std(self.config.grace_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        if age < grace {
            debug!(
                instance_id = instance.id,
                age_secs = age.num_seconds(),
                "skipping instance inside grace window"
            );
            return false;
        }

        true
    }

    /// Probe one instance. Returns Ok(true) if it was confirmed dead and
    /// healed.
    async fn check_instance(&self, instance: &InstanceRecord) -> Result<bool, String> {
        let pid = instance
            .pid
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "instance listed without a PID".to_string())?;

        let machine = self
            .persistence
            .get_machine(instance.machine_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("machine {} not found", instance.machine_id))?;

        // The `|| echo` keeps the command's exit code clean: a missing PID is
        // an answer, not a failure.
        let probe = format!("ps -p {} -o pid= || echo \"not found\"", pid);
        let output = match self.remote.execute_command(&machine, &probe).await {
            Ok(output) => output,
            Err(e) if e.is_unreachable() => {
                // Conservative rule: an unreachable host proves nothing about
                // the process. Assume alive, touch nothing.
                warn!(
                    instance_id = instance.id,
                    machine = %machine.name,
                    error = %e,
                    "liveness probe unreachable, assuming process alive"
                );
                return Ok(false);
            }
            Err(e) => {
                warn!(
                    instance_id = instance.id,
                    machine = %machine.name,
                    error = %e,
                    "liveness probe failed, assuming process alive"
                );
                return Ok(false);
            }
        };

        let alive = !output.contains("not found") && !output.trim().is_empty();
        if alive {
            debug!(instance_id = instance.id, pid, "process alive");
            return Ok(false);
        }

        warn!(
            instance_id = instance.id,
            machine = %machine.name,
            pid,
            "detected externally-dead process, resetting instance"
        );

        // Conditional write: only applies while the instance is still in a
        // reconciled state with its PID intact, so an operator transition
        // that raced the probe wins.
        let applied = self
            .persistence
            .reset_instance_if_dead(
                instance.id,
                &[
                    InstanceState::Running.as_str(),
                    InstanceState::StopFailed.as_str(),
                ],
            )
            .await
            .map_err(|e| e.to_string())?;

        if applied {
            info!(instance_id = instance.id, "instance reset to not_started");
        } else {
            debug!(
                instance_id = instance.id,
                "reset skipped, instance changed concurrently"
            );
        }

        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(600_000));
        assert_eq!(config.grace_window, Duration::from_secs(300));
    }
}
