// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step executors: the units of remote work that tasks are made of.
//!
//! Each executor performs one step for one instance and reports a
//! [`StepOutcome`]. Expected remote failures (non-zero exit, unreachable
//! host) are converted to a failed outcome with an error string - they are
//! never propagated as errors, so a failing machine can never abort the
//! task runner's sweep over the other instances.
//!
//! Executors are written to tolerate re-runs: `mkdir -p`, overwriting
//! uploads and config writes, and start/stop guards that first check whether
//! the work is already done. A failed initialize is retried by simply
//! running the whole sequence again.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::paths;
use crate::persistence::{InstanceRecord, MachineRecord, Persistence, ProcessRecord};
use crate::remote::{RemoteError, RemoteExecutor};

/// Kinds of remote work a task can be composed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Create the instance's deploy directory.
    CreateRemoteDir,
    /// Upload the shipper package tarball and verify it landed.
    UploadPackage,
    /// Extract the uploaded package inside the deploy directory.
    ExtractPackage,
    /// Render and write the pipeline configuration.
    WriteConfig,
    /// Write system-level configuration (JVM options).
    ApplySystemConfig,
    /// Spawn the shipper process and capture its PID.
    StartProcess,
    /// Poll until the captured PID is confirmed alive.
    VerifyProcess,
    /// Signal the process and verify it died; clears the recorded PID.
    StopProcess,
    /// Delete the instance's deploy directory (scale-in cleanup).
    DeleteDirectory,
}

impl StepKind {
    /// Storage identifier for this step kind.
    pub fn id(&self) -> &'static str {
        match self {
            Self::CreateRemoteDir => "create_remote_dir",
            Self::UploadPackage => "upload_package",
            Self::ExtractPackage => "extract_package",
            Self::WriteConfig => "write_config",
            Self::ApplySystemConfig => "apply_system_config",
            Self::StartProcess => "start_process",
            Self::VerifyProcess => "verify_process",
            Self::StopProcess => "stop_process",
            Self::DeleteDirectory => "delete_directory",
        }
    }

    /// Human-readable step name for progress displays.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::CreateRemoteDir => "Create remote directory",
            Self::UploadPackage => "Upload package",
            Self::ExtractPackage => "Extract package",
            Self::WriteConfig => "Write pipeline config",
            Self::ApplySystemConfig => "Apply system config",
            Self::StartProcess => "Start process",
            Self::VerifyProcess => "Verify process",
            Self::StopProcess => "Stop process",
            Self::DeleteDirectory => "Delete deploy directory",
        }
    }

    /// Parse a storage identifier back into a step kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create_remote_dir" => Some(Self::CreateRemoteDir),
            "upload_package" => Some(Self::UploadPackage),
            "extract_package" => Some(Self::ExtractPackage),
            "write_config" => Some(Self::WriteConfig),
            "apply_system_config" => Some(Self::ApplySystemConfig),
            "start_process" => Some(Self::StartProcess),
            "verify_process" => Some(Self::VerifyProcess),
            "stop_process" => Some(Self::StopProcess),
            "delete_directory" => Some(Self::DeleteDirectory),
            _ => None,
        }
    }
}

/// Step sequence for the initialize operation.
pub const INITIALIZE_SEQUENCE: &[StepKind] = &[
    StepKind::CreateRemoteDir,
    StepKind::UploadPackage,
    StepKind::ExtractPackage,
    StepKind::WriteConfig,
    StepKind::ApplySystemConfig,
];

/// Step sequence for the start operation.
pub const START_SEQUENCE: &[StepKind] = &[StepKind::StartProcess, StepKind::VerifyProcess];

/// Step sequence for the stop operation.
pub const STOP_SEQUENCE: &[StepKind] = &[StepKind::StopProcess];

/// Result of executing one step for one instance.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Whether the step succeeded.
    pub success: bool,
    /// Error description when the step failed.
    pub error: Option<String>,
}

impl StepOutcome {
    /// Successful outcome.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Failed outcome with an error description.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Poll/settle budgets for the start, verify, and stop steps.
#[derive(Debug, Clone)]
pub struct StepTimings {
    /// Pause after spawning before the PID file is read.
    pub start_settle: Duration,
    /// Liveness poll attempts during verify.
    pub verify_attempts: u32,
    /// Pause between verify polls.
    pub verify_interval: Duration,
    /// Poll attempts while waiting for a graceful stop.
    pub stop_poll_attempts: u32,
    /// Pause between stop polls.
    pub stop_poll_interval: Duration,
    /// Poll attempts after escalating to SIGKILL.
    pub force_stop_poll_attempts: u32,
}

impl Default for StepTimings {
    fn default() -> Self {
        Self {
            start_settle: Duration::from_secs(3),
            verify_attempts: 5,
            verify_interval: Duration::from_secs(2),
            stop_poll_attempts: 20,
            stop_poll_interval: Duration::from_secs(3),
            force_stop_poll_attempts: 10,
        }
    }
}

impl StepTimings {
    /// Near-zero budgets for tests.
    pub fn fast() -> Self {
        Self {
            start_settle: Duration::from_millis(5),
            verify_attempts: 2,
            verify_interval: Duration::from_millis(5),
            stop_poll_attempts: 2,
            stop_poll_interval: Duration::from_millis(5),
            force_stop_poll_attempts: 2,
        }
    }
}

/// Everything a step needs about its target.
pub struct StepContext<'a> {
    /// The instance being operated on.
    pub instance: &'a InstanceRecord,
    /// The owning process definition.
    pub process: &'a ProcessRecord,
    /// The machine the instance lives on.
    pub machine: &'a MachineRecord,
}

/// Shared collaborators handed to every step executor.
pub struct StepDeps<'a> {
    /// Transport to the machine.
    pub remote: &'a dyn RemoteExecutor,
    /// Repository, used by start/stop to write the captured PID through.
    pub persistence: &'a dyn Persistence,
    /// Orchestrator configuration (package path).
    pub config: &'a Config,
    /// Poll/settle budgets.
    pub timings: &'a StepTimings,
}

/// Execute one step for one instance.
pub async fn run_step(kind: StepKind, ctx: &StepContext<'_>, deps: &StepDeps<'_>) -> StepOutcome {
    debug!(
        step = kind.id(),
        instance_id = ctx.instance.id,
        machine = %ctx.machine.name,
        "executing step"
    );

    let outcome = match kind {
        StepKind::CreateRemoteDir => create_remote_dir(ctx, deps).await,
        StepKind::UploadPackage => upload_package(ctx, deps).await,
        StepKind::ExtractPackage => extract_package(ctx, deps).await,
        StepKind::WriteConfig => write_config(ctx, deps).await,
        StepKind::ApplySystemConfig => apply_system_config(ctx, deps).await,
        StepKind::StartProcess => start_process(ctx, deps).await,
        StepKind::VerifyProcess => verify_process(ctx, deps).await,
        StepKind::StopProcess => stop_process(ctx, deps).await,
        StepKind::DeleteDirectory => delete_directory(ctx, deps).await,
    };

    if outcome.success {
        debug!(step = kind.id(), instance_id = ctx.instance.id, "step completed");
    } else {
        warn!(
            step = kind.id(),
            instance_id = ctx.instance.id,
            error = outcome.error.as_deref().unwrap_or(""),
            "step failed"
        );
    }

    outcome
}

fn remote_failure(action: &str, err: &RemoteError) -> StepOutcome {
    StepOutcome::fail(format!("{}: {}", action, err))
}

async fn create_remote_dir(ctx: &StepContext<'_>, deps: &StepDeps<'_>) -> StepOutcome {
    let dir = &ctx.instance.deploy_path;
    let command = format!("mkdir -p {}", dir);
    match deps.remote.execute_command(ctx.machine, &command).await {
        Ok(_) => StepOutcome::ok(),
        Err(e) => remote_failure("create directory failed", &e),
    }
}

async fn upload_package(ctx: &StepContext<'_>, deps: &StepDeps<'_>) -> StepOutcome {
    let dir = &ctx.instance.deploy_path;
    let package_name = paths::package_file_name(&deps.config.package_path);
    let remote_package = format!("{}/{}", dir.trim_end_matches('/'), package_name);

    if let Err(e) = deps
        .remote
        .upload_file(ctx.machine, &deps.config.package_path, &remote_package)
        .await
    {
        return remote_failure("package upload failed", &e);
    }

    // Verify the file actually landed before calling the step done.
    let check = format!(
        "if [ -f \"{}\" ]; then echo \"exists\"; else echo \"missing\"; fi",
        remote_package
    );
    match deps.remote.execute_command(ctx.machine, &check).await {
        Ok(output) if output.trim() == "exists" => StepOutcome::ok(),
        Ok(_) => StepOutcome::fail(format!(
            "package missing after upload: {}",
            remote_package
        )),
        Err(e) => remote_failure("package verification failed", &e),
    }
}

async fn extract_package(ctx: &StepContext<'_>, deps: &StepDeps<'_>) -> StepOutcome {
    let dir = ctx.instance.deploy_path.trim_end_matches('/');
    let package_name = paths::package_file_name(&deps.config.package_path);
    let command = format!("cd {} && tar -xzf {}", dir, package_name);
    match deps.remote.execute_command(ctx.machine, &command).await {
        Ok(_) => StepOutcome::ok(),
        Err(e) => remote_failure("package extraction failed", &e),
    }
}

async fn write_config(ctx: &StepContext<'_>, deps: &StepDeps<'_>) -> StepOutcome {
    let dir = &ctx.instance.deploy_path;
    let config_path = paths::pipeline_config_path(dir);
    let command = format!(
        "mkdir -p {} && cat > {} << 'LOGFLEET_EOF'\n{}\nLOGFLEET_EOF",
        paths::config_dir(dir),
        config_path,
        ctx.process.pipeline_config
    );
    match deps.remote.execute_command(ctx.machine, &command).await {
        Ok(_) => StepOutcome::ok(),
        Err(e) => remote_failure("writing pipeline config failed", &e),
    }
}

async fn apply_system_config(ctx: &StepContext<'_>, deps: &StepDeps<'_>) -> StepOutcome {
    let Some(jvm_options) = ctx
        .process
        .jvm_options
        .as_deref()
        .filter(|o| !o.trim().is_empty())
    else {
        // Nothing to apply for this process.
        return StepOutcome::ok();
    };

    let dir = &ctx.instance.deploy_path;
    let command = format!(
        "mkdir -p {} && cat > {} << 'LOGFLEET_EOF'\n{}\nLOGFLEET_EOF",
        paths::config_dir(dir),
        paths::jvm_options_path(dir),
        jvm_options
    );
    match deps.remote.execute_command(ctx.machine, &command).await {
        Ok(_) => StepOutcome::ok(),
        Err(e) => remote_failure("writing jvm options failed", &e),
    }
}

async fn start_process(ctx: &StepContext<'_>, deps: &StepDeps<'_>) -> StepOutcome {
    let instance_id = ctx.instance.id;
    let dir = ctx.instance.deploy_path.trim_end_matches('/');
    let pid_file = paths::pid_file_path(dir, instance_id);
    let config_path = paths::pipeline_config_path(dir);
    let log_dir = paths::log_dir(dir);
    let log_file = paths::log_file_path(dir, instance_id);
    let script_path = paths::start_script_path(dir, instance_id);

    // Guard: if a prior attempt left the process running, adopt it instead of
    // spawning a second one.
    let guard = format!(
        "if [ -f \"{pid}\" ] && ps -p $(cat {pid}) > /dev/null 2>&1; then cat {pid}; fi",
        pid = pid_file
    );
    if let Ok(output) = deps.remote.execute_command(ctx.machine, &guard).await {
        let pid = output.trim();
        if !pid.is_empty() {
            info!(instance_id, pid, "shipper already running, adopting PID");
            if let Err(e) = deps
                .persistence
                .update_instance_pid(instance_id, Some(pid))
                .await
            {
                return StepOutcome::fail(format!("recording adopted PID failed: {}", e));
            }
            return StepOutcome::ok();
        }
    }

    let prepare = format!("mkdir -p {} && rm -f {}", log_dir, pid_file);
    if let Err(e) = deps.remote.execute_command(ctx.machine, &prepare).await {
        return remote_failure("preparing start failed", &e);
    }

    let script = format!(
        "#!/bin/bash\ncd {dir}\nnohup ./bin/shipper -f {config} --path.logs {logs} > {log} 2>&1 < /dev/null &\necho $! > {pid}\n",
        dir = dir,
        config = config_path,
        logs = log_dir,
        log = log_file,
        pid = pid_file
    );
    let write_script = format!(
        "cat > {path} << 'LOGFLEET_EOF'\n{script}\nLOGFLEET_EOF\nchmod +x {path}",
        path = script_path,
        script = script
    );
    if let Err(e) = deps.remote.execute_command(ctx.machine, &write_script).await {
        return remote_failure("writing start script failed", &e);
    }

    if let Err(e) = deps.remote.execute_command(ctx.machine, &script_path).await {
        return remote_failure("start script failed", &e);
    }

    // Give the spawn a moment before the PID file is read.
    tokio::time::sleep(deps.timings.start_settle).await;

    let read_pid = format!("cat {} 2>/dev/null", pid_file);
    let pid = match deps.remote.execute_command(ctx.machine, &read_pid).await {
        Ok(output) => output.trim().to_string(),
        Err(e) => return remote_failure("reading PID file failed", &e),
    };
    if pid.is_empty() {
        return StepOutcome::fail("PID file empty after start, spawn likely failed");
    }

    info!(instance_id, pid = %pid, "shipper process spawned");
    if let Err(e) = deps
        .persistence
        .update_instance_pid(instance_id, Some(&pid))
        .await
    {
        return StepOutcome::fail(format!("recording PID failed: {}", e));
    }

    StepOutcome::ok()
}

async fn verify_process(ctx: &StepContext<'_>, deps: &StepDeps<'_>) -> StepOutcome {
    let instance_id = ctx.instance.id;

    // The start step wrote the PID through to the instance row; fall back to
    // the PID file if this context predates it.
    let pid = match deps.persistence.get_instance(instance_id).await {
        Ok(Some(record)) => record.pid,
        Ok(None) => return StepOutcome::fail("instance row disappeared during verify"),
        Err(e) => return StepOutcome::fail(format!("loading instance failed: {}", e)),
    };
    let pid = match pid.filter(|p| !p.is_empty()) {
        Some(pid) => pid,
        None => {
            let read_pid = format!(
                "cat {} 2>/dev/null",
                paths::pid_file_path(&ctx.instance.deploy_path, instance_id)
            );
            match deps.remote.execute_command(ctx.machine, &read_pid).await {
                Ok(output) if !output.trim().is_empty() => output.trim().to_string(),
                Ok(_) => return StepOutcome::fail("no PID recorded, nothing to verify"),
                Err(e) => return remote_failure("reading PID file failed", &e),
            }
        }
    };

    let probe = format!("ps -p {} -o pid= || true", pid);
    let mut last_error = String::new();
    for attempt in 0..deps.timings.verify_attempts {
        if attempt > 0 {
            tokio::time::sleep(deps.timings.verify_interval).await;
        }
        match deps.remote.execute_command(ctx.machine, &probe).await {
            Ok(output) if output.trim() == pid => {
                debug!(instance_id, pid = %pid, "shipper process verified alive");
                return StepOutcome::ok();
            }
            Ok(_) => last_error = format!("PID {} not found in process table", pid),
            Err(e) => last_error = format!("liveness probe failed: {}", e),
        }
    }

    StepOutcome::fail(format!(
        "process not confirmed alive after {} attempts: {}",
        deps.timings.verify_attempts, last_error
    ))
}

async fn stop_process(ctx: &StepContext<'_>, deps: &StepDeps<'_>) -> StepOutcome {
    let instance_id = ctx.instance.id;
    let pid_file = paths::pid_file_path(&ctx.instance.deploy_path, instance_id);

    // Prefer the recorded PID; fall back to the PID file on the machine.
    let recorded = match deps.persistence.get_instance(instance_id).await {
        Ok(Some(record)) => record.pid.filter(|p| !p.is_empty()),
        Ok(None) => None,
        Err(e) => return StepOutcome::fail(format!("loading instance failed: {}", e)),
    };
    let pid = match recorded {
        Some(pid) => pid,
        None => {
            let read_pid = format!("cat {} 2>/dev/null", pid_file);
            match deps.remote.execute_command(ctx.machine, &read_pid).await {
                Ok(output) => output.trim().to_string(),
                Err(e) => return remote_failure("reading PID file failed", &e),
            }
        }
    };

    if pid.is_empty() {
        // Nothing recorded anywhere: treat as already stopped.
        let cleanup = format!("rm -f {}", pid_file);
        let _ = deps.remote.execute_command(ctx.machine, &cleanup).await;
        if let Err(e) = deps.persistence.update_instance_pid(instance_id, None).await {
            return StepOutcome::fail(format!("clearing PID failed: {}", e));
        }
        return StepOutcome::ok();
    }

    info!(instance_id, pid = %pid, "stopping shipper process");

    // Graceful signal first. A kill of an already-dead PID exits non-zero;
    // the polling below settles whether the process is actually gone.
    let graceful = format!("kill {}", pid);
    if let Err(e) = deps.remote.execute_command(ctx.machine, &graceful).await
        && e.is_unreachable()
    {
        return remote_failure("stop signal failed", &e);
    }

    let mut stopped = wait_for_exit(ctx, deps, &pid, deps.timings.stop_poll_attempts).await;

    if !stopped {
        warn!(instance_id, pid = %pid, "graceful stop timed out, escalating to SIGKILL");
        let force = format!("kill -9 {}", pid);
        if let Err(e) = deps.remote.execute_command(ctx.machine, &force).await
            && e.is_unreachable()
        {
            return remote_failure("force stop signal failed", &e);
        }
        stopped = wait_for_exit(ctx, deps, &pid, deps.timings.force_stop_poll_attempts).await;
    }

    if !stopped {
        return StepOutcome::fail(format!("process {} did not stop", pid));
    }

    let cleanup = format!("rm -f {}", pid_file);
    let _ = deps.remote.execute_command(ctx.machine, &cleanup).await;
    if let Err(e) = deps.persistence.update_instance_pid(instance_id, None).await {
        return StepOutcome::fail(format!("clearing PID failed: {}", e));
    }

    info!(instance_id, pid = %pid, "shipper process stopped");
    StepOutcome::ok()
}

/// Poll until the PID leaves the process table or the attempt budget runs out.
async fn wait_for_exit(
    ctx: &StepContext<'_>,
    deps: &StepDeps<'_>,
    pid: &str,
    attempts: u32,
) -> bool {
    let probe = format!(
        "if ps -p {} > /dev/null 2>&1; then echo \"running\"; else echo \"stopped\"; fi",
        pid
    );
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(deps.timings.stop_poll_interval).await;
        }
        match deps.remote.execute_command(ctx.machine, &probe).await {
            Ok(output) if output.trim() == "stopped" => return true,
            Ok(_) => {}
            // Transient probe failures keep polling; the budget bounds us.
            Err(e) => debug!(pid, error = %e, "stop poll failed, retrying"),
        }
    }
    false
}

async fn delete_directory(ctx: &StepContext<'_>, deps: &StepDeps<'_>) -> StepOutcome {
    let dir = &ctx.instance.deploy_path;
    if !paths::is_safe_to_delete(dir) {
        return StepOutcome::fail(format!("refusing to delete suspicious path '{}'", dir));
    }
    let command = format!("rm -rf {}", dir);
    match deps.remote.execute_command(ctx.machine, &command).await {
        Ok(_) => StepOutcome::ok(),
        Err(e) => remote_failure("directory deletion failed", &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryPersistence, NewInstance, NewMachine, NewProcess};
    use crate::remote::MockRemoteExecutor;
    use std::sync::Arc;

    async fn fixture(store: &MemoryPersistence) -> (ProcessRecord, MachineRecord, InstanceRecord) {
        let machine_id = store
            .insert_machine(&NewMachine {
                name: "m1".to_string(),
                host: "10.0.0.1".to_string(),
                port: 22,
                username: "deploy".to_string(),
            })
            .await
            .unwrap();
        let process_id = store
            .insert_process(&NewProcess {
                name: "nginx-access".to_string(),
                module: "nginx".to_string(),
                pipeline_config: "input {}\noutput {}".to_string(),
                jvm_options: None,
                deploy_base_dir: "/opt/logfleet".to_string(),
            })
            .await
            .unwrap();
        let instance_id = store
            .insert_instance(&NewInstance {
                process_id,
                machine_id,
                deploy_path: "/opt/logfleet/shipper-1".to_string(),
                state: "not_started".to_string(),
            })
            .await
            .unwrap();
        (
            store.get_process(process_id).await.unwrap().unwrap(),
            store.get_machine(machine_id).await.unwrap().unwrap(),
            store.get_instance(instance_id).await.unwrap().unwrap(),
        )
    }

    #[test]
    fn test_step_kind_round_trip() {
        for kind in [
            StepKind::CreateRemoteDir,
            StepKind::UploadPackage,
            StepKind::ExtractPackage,
            StepKind::WriteConfig,
            StepKind::ApplySystemConfig,
            StepKind::StartProcess,
            StepKind::VerifyProcess,
            StepKind::StopProcess,
            StepKind::DeleteDirectory,
        ] {
            assert_eq!(StepKind::parse(kind.id()), Some(kind));
        }
        assert_eq!(StepKind::parse("bogus"), None);
    }

    #[tokio::test]
    async fn test_start_captures_pid() {
        let store = Arc::new(MemoryPersistence::new());
        let (process, machine, instance) = fixture(&store).await;
        let remote = MockRemoteExecutor::new();
        // Matches only the post-spawn PID file read, not the adoption guard.
        remote.respond(".pid 2>/dev/null", "4711\n").await;

        let config = Config::default();
        let timings = StepTimings::fast();
        let ctx = StepContext {
            instance: &instance,
            process: &process,
            machine: &machine,
        };
        let deps = StepDeps {
            remote: &remote,
            persistence: store.as_ref(),
            config: &config,
            timings: &timings,
        };

        let outcome = run_step(StepKind::StartProcess, &ctx, &deps).await;
        assert!(outcome.success, "{:?}", outcome.error);

        let record = store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(record.pid.as_deref(), Some("4711"));
    }

    #[tokio::test]
    async fn test_stop_clears_pid() {
        let store = Arc::new(MemoryPersistence::new());
        let (process, machine, instance) = fixture(&store).await;
        store
            .update_instance_pid(instance.id, Some("4711"))
            .await
            .unwrap();

        let remote = MockRemoteExecutor::new();
        remote.respond("if ps -p 4711", "stopped").await;

        let config = Config::default();
        let timings = StepTimings::fast();
        let ctx = StepContext {
            instance: &instance,
            process: &process,
            machine: &machine,
        };
        let deps = StepDeps {
            remote: &remote,
            persistence: store.as_ref(),
            config: &config,
            timings: &timings,
        };

        let outcome = run_step(StepKind::StopProcess, &ctx, &deps).await;
        assert!(outcome.success, "{:?}", outcome.error);

        let record = store.get_instance(instance.id).await.unwrap().unwrap();
        assert!(record.pid.is_none());
        assert!(remote.command_count("kill 4711").await >= 1);
    }

    #[tokio::test]
    async fn test_unreachable_machine_fails_step_without_panicking() {
        let store = Arc::new(MemoryPersistence::new());
        let (process, machine, instance) = fixture(&store).await;
        let remote = MockRemoteExecutor::unreachable();

        let config = Config::default();
        let timings = StepTimings::fast();
        let ctx = StepContext {
            instance: &instance,
            process: &process,
            machine: &machine,
        };
        let deps = StepDeps {
            remote: &remote,
            persistence: store.as_ref(),
            config: &config,
            timings: &timings,
        };

        let outcome = run_step(StepKind::CreateRemoteDir, &ctx, &deps).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_apply_system_config_skips_without_jvm_options() {
        let store = Arc::new(MemoryPersistence::new());
        let (process, machine, instance) = fixture(&store).await;
        let remote = MockRemoteExecutor::new();

        let config = Config::default();
        let timings = StepTimings::fast();
        let ctx = StepContext {
            instance: &instance,
            process: &process,
            machine: &machine,
        };
        let deps = StepDeps {
            remote: &remote,
            persistence: store.as_ref(),
            config: &config,
            timings: &timings,
        };

        let outcome = run_step(StepKind::ApplySystemConfig, &ctx, &deps).await;
        assert!(outcome.success);
        // No JVM options on the process: nothing was sent to the machine.
        assert!(remote.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_directory_refuses_unsafe_path() {
        let store = Arc::new(MemoryPersistence::new());
        let (process, machine, mut instance) = fixture(&store).await;
        instance.deploy_path = "/".to_string();
        let remote = MockRemoteExecutor::new();

        let config = Config::default();
        let timings = StepTimings::fast();
        let ctx = StepContext {
            instance: &instance,
            process: &process,
            machine: &machine,
        };
        let deps = StepDeps {
            remote: &remote,
            persistence: store.as_ref(),
            config: &config,
            timings: &timings,
        };

        let outcome = run_step(StepKind::DeleteDirectory, &ctx, &deps).await;
        assert!(!outcome.success);
        assert!(remote.commands().await.is_empty());
    }
}
