// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploy path construction.
//!
//! Every file the orchestrator touches on a machine lives under the
//! instance's deploy directory. The layout is fixed:
//!
//! ```text
//! {deploy_path}/
//!   config/pipeline.conf       rendered pipeline configuration
//!   config/jvm.options         JVM options (when the process defines any)
//!   logs/shipper-{id}.log      stdout/stderr of the shipper process
//!   shipper-{id}.pid           PID file written by the start script
//!   start-shipper-{id}.sh      generated start script
//! ```

/// Default deploy directory for instances of a process, used when the
/// operator does not supply a custom path.
pub fn default_instance_dir(deploy_base_dir: &str, process_id: i64) -> String {
    format!(
        "{}/shipper-{}",
        deploy_base_dir.trim_end_matches('/'),
        process_id
    )
}

/// Config directory inside a deploy directory.
pub fn config_dir(deploy_path: &str) -> String {
    format!("{}/config", deploy_path.trim_end_matches('/'))
}

/// Pipeline configuration file path.
pub fn pipeline_config_path(deploy_path: &str) -> String {
    format!("{}/pipeline.conf", config_dir(deploy_path))
}

/// JVM options file path.
pub fn jvm_options_path(deploy_path: &str) -> String {
    format!("{}/jvm.options", config_dir(deploy_path))
}

/// Log directory inside a deploy directory.
pub fn log_dir(deploy_path: &str) -> String {
    format!("{}/logs", deploy_path.trim_end_matches('/'))
}

/// Log file path for an instance.
pub fn log_file_path(deploy_path: &str, instance_id: i64) -> String {
    format!("{}/shipper-{}.log", log_dir(deploy_path), instance_id)
}

/// PID file path for an instance.
pub fn pid_file_path(deploy_path: &str, instance_id: i64) -> String {
    format!(
        "{}/shipper-{}.pid",
        deploy_path.trim_end_matches('/'),
        instance_id
    )
}

/// Generated start script path for an instance.
pub fn start_script_path(deploy_path: &str, instance_id: i64) -> String {
    format!(
        "{}/start-shipper-{}.sh",
        deploy_path.trim_end_matches('/'),
        instance_id
    )
}

/// File name component of the package tarball.
pub fn package_file_name(package_path: &str) -> &str {
    package_path
        .rsplit('/')
        .next()
        .unwrap_or(package_path)
}

/// Whether a deploy path is safe to hand to `rm -rf`.
///
/// Requires an absolute path with at least two components and no parent
/// traversal, so a corrupted record can never aim the cleanup step at `/`
/// or outside the deploy tree.
pub fn is_safe_to_delete(deploy_path: &str) -> bool {
    let trimmed = deploy_path.trim_end_matches('/');
    trimmed.starts_with('/')
        && trimmed.matches('/').count() >= 2
        && !trimmed.split('/').any(|c| c == "..")
}
