// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator surface of the orchestration engine.
//!
//! Every operation validates synchronously - unknown ids, illegal state
//! transitions, and malformed scale requests are rejected before any row is
//! written - then creates a task, submits its body to the worker pool, and
//! returns the task id. The caller polls task/step status via
//! [`Orchestrator::task_detail`].

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::CoreError;
use crate::persistence::{
    InstanceRecord, MachineRecord, NewProcess, Persistence, ProcessRecord,
};
use crate::remote::RemoteExecutor;
use crate::scale::{ScaleController, ScaleRequest};
use crate::state::{self, OperationType, StateMachine};
use crate::steps::{START_SEQUENCE, STOP_SEQUENCE, StepTimings};
use crate::task::{self, TaskDetail, TaskRunner};

/// Request to create a process definition together with its first instances.
#[derive(Debug, Clone)]
pub struct CreateProcessRequest {
    /// Unique process name.
    pub name: String,
    /// Module the process ships logs for.
    pub module: String,
    /// Pipeline configuration content.
    pub pipeline_config: String,
    /// JVM options content, if any.
    pub jvm_options: Option<String>,
    /// Machines to deploy one instance each onto.
    pub machine_ids: Vec<i64>,
    /// Explicit deploy path; blank means the process default.
    pub custom_deploy_path: Option<String>,
    /// Override of the configured deploy base dir for this process.
    pub deploy_base_dir: Option<String>,
}

/// Result of creating a process: the new row plus the initialize task
/// covering its first instances.
#[derive(Debug, Clone)]
pub struct ProcessCreated {
    /// Id of the new process row.
    pub process_id: i64,
    /// Ids of the instances created alongside it.
    pub instance_ids: Vec<i64>,
    /// Task running the initialize sequence for those instances.
    pub task_id: String,
}

/// The orchestration engine's operator surface.
pub struct Orchestrator {
    persistence: Arc<dyn Persistence>,
    remote: Arc<dyn RemoteExecutor>,
    runner: Arc<TaskRunner>,
    state_machine: Arc<StateMachine>,
    scaler: ScaleController,
    config: Config,
}

impl Orchestrator {
    /// Wire up the engine over a persistence backend and a remote executor.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        remote: Arc<dyn RemoteExecutor>,
        config: Config,
        timings: StepTimings,
    ) -> Self {
        let runner = Arc::new(TaskRunner::new(
            persistence.clone(),
            config.max_concurrent_tasks,
        ));
        let state_machine = Arc::new(StateMachine::new(
            persistence.clone(),
            remote.clone(),
            runner.clone(),
            config.clone(),
            timings.clone(),
        ));
        let scaler = ScaleController::new(
            persistence.clone(),
            remote.clone(),
            runner.clone(),
            state_machine.clone(),
            config.clone(),
            timings,
        );
        Self {
            persistence,
            remote,
            runner,
            state_machine,
            scaler,
            config,
        }
    }

    // ========================================================================
    // Process creation
    // ========================================================================

    /// Create a process definition, its first instances (one per machine),
    /// and submit the initialize task for them.
    pub async fn create_process(
        &self,
        request: &CreateProcessRequest,
    ) -> Result<ProcessCreated, CoreError> {
        if request.machine_ids.is_empty() {
            return Err(CoreError::validation("machine list cannot be empty"));
        }
        if request.name.trim().is_empty() {
            return Err(CoreError::validation("process name cannot be empty"));
        }
        if self
            .persistence
            .find_process_by_name(&request.name)
            .await?
            .is_some()
        {
            return Err(CoreError::validation(format!(
                "process name '{}' already exists",
                request.name
            )));
        }

        let mut machines = Vec::with_capacity(request.machine_ids.len());
        for machine_id in &request.machine_ids {
            machines.push(self.machine(*machine_id).await?);
        }

        let process_id = self
            .persistence
            .insert_process(&NewProcess {
                name: request.name.clone(),
                module: request.module.clone(),
                pipeline_config: request.pipeline_config.clone(),
                jvm_options: request.jvm_options.clone(),
                deploy_base_dir: request
                    .deploy_base_dir
                    .clone()
                    .unwrap_or_else(|| self.config.deploy_base_dir.clone()),
            })
            .await?;
        let process = self.process(process_id).await?;
        info!(process_id, name = %process.name, "process created");

        let instances = self
            .scaler
            .create_instances_checked(
                &process,
                &machines,
                request.custom_deploy_path.as_deref(),
            )
            .await?;
        let instance_ids = instances.iter().map(|i| i.id).collect();
        let targets: Vec<(InstanceRecord, MachineRecord)> =
            instances.into_iter().zip(machines.into_iter()).collect();

        let task_id = self
            .launch_operation(&process, targets, OperationType::Initialize)
            .await?;

        Ok(ProcessCreated {
            process_id,
            instance_ids,
            task_id,
        })
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Initialize instances of a process: create the deploy directory,
    /// upload and extract the package, write configs.
    ///
    /// `instance_ids` of None targets every instance of the process.
    pub async fn initialize(
        &self,
        process_id: i64,
        instance_ids: Option<&[i64]>,
    ) -> Result<String, CoreError> {
        let (process, targets) = self.resolve_targets(process_id, instance_ids).await?;
        self.launch_operation(&process, targets, OperationType::Initialize)
            .await
    }

    /// Start instances: spawn the shipper process and verify it is alive.
    pub async fn start(
        &self,
        process_id: i64,
        instance_ids: Option<&[i64]>,
    ) -> Result<String, CoreError> {
        let (process, targets) = self.resolve_targets(process_id, instance_ids).await?;
        self.launch_operation(&process, targets, OperationType::Start)
            .await
    }

    /// Stop instances. Also the supported way to cancel an INITIALIZING
    /// instance.
    pub async fn stop(
        &self,
        process_id: i64,
        instance_ids: Option<&[i64]>,
    ) -> Result<String, CoreError> {
        let (process, targets) = self.resolve_targets(process_id, instance_ids).await?;
        self.launch_operation(&process, targets, OperationType::Stop)
            .await
    }

    /// Emergency stop: runs the stop steps and forces the instances to
    /// NOT_STARTED regardless of command outcome. Skips capability checks.
    pub async fn force_stop(
        &self,
        process_id: i64,
        instance_ids: Option<&[i64]>,
    ) -> Result<String, CoreError> {
        let (process, targets) = self.resolve_targets(process_id, instance_ids).await?;
        self.launch_operation(&process, targets, OperationType::ForceStop)
            .await
    }

    /// Restart one instance: stop, then start+verify, as a single task. The
    /// start half is skipped if the stop half fails.
    pub async fn restart_instance(&self, instance_id: i64) -> Result<String, CoreError> {
        let instance = self.instance(instance_id).await?;
        let process = self.process(instance.process_id).await?;
        let machine = self.machine(instance.machine_id).await?;

        state::ensure_allowed(OperationType::Restart, &instance)?;
        self.check_machine_connection(&machine).await?;

        let targets = vec![(instance, machine)];
        let task_id = self
            .runner
            .create_task(
                process.id,
                Some(instance_id),
                &format!("Restart instance [{}] of [{}]", instance_id, process.name),
                "Stop and start the shipper process",
                OperationType::Restart,
                OperationType::Restart.step_sequence(),
                &targets,
            )
            .await?;

        let state_machine = self.state_machine.clone();
        let runner = self.runner.clone();
        let persistence = self.persistence.clone();
        let body_task_id = task_id.clone();
        self.runner.submit(
            task_id.clone(),
            async move {
                let stop_outcomes = state_machine
                    .run_steps_with_transitions(
                        &body_task_id,
                        OperationType::Stop,
                        STOP_SEQUENCE,
                        &process,
                        &targets,
                    )
                    .await?;

                if !stop_outcomes.get(&instance_id).copied().unwrap_or(false) {
                    runner
                        .skip_steps(&body_task_id, instance_id, START_SEQUENCE)
                        .await;
                    return Ok(false);
                }

                // Re-read the instance: the stop half moved it to NOT_STARTED.
                let Some((instance, machine)) = targets.into_iter().next() else {
                    return Ok(false);
                };
                let refreshed = persistence
                    .get_instance(instance.id)
                    .await?
                    .unwrap_or(instance);
                let start_outcomes = state_machine
                    .run_steps_with_transitions(
                        &body_task_id,
                        OperationType::Start,
                        START_SEQUENCE,
                        &process,
                        &[(refreshed, machine)],
                    )
                    .await?;

                Ok(start_outcomes.values().all(|ok| *ok))
            },
            None,
        );

        Ok(task_id)
    }

    // ========================================================================
    // Scaling
    // ========================================================================

    /// Scale a process out or in. Returns the task id driving the remote
    /// work; validation errors surface synchronously with nothing mutated.
    pub async fn scale(
        &self,
        process_id: i64,
        request: &ScaleRequest,
    ) -> Result<String, CoreError> {
        let process = self.process(process_id).await?;
        self.scaler.scale(&process, request).await
    }

    // ========================================================================
    // Read-only surface
    // ========================================================================

    /// Progress view of a task: status, steps grouped by instance, counts.
    pub async fn task_detail(&self, task_id: &str) -> Result<Option<TaskDetail>, CoreError> {
        task::get_task_detail(self.persistence.as_ref(), task_id).await
    }

    /// All task ids recorded for a process, newest first.
    pub async fn process_task_ids(&self, process_id: i64) -> Result<Vec<String>, CoreError> {
        let tasks = self.persistence.list_tasks_by_process(process_id).await?;
        Ok(tasks.into_iter().map(|t| t.id).collect())
    }

    /// All task ids that touched an instance, newest first. Survives the
    /// instance's removal - history is retained.
    pub async fn instance_task_ids(&self, instance_id: i64) -> Result<Vec<String>, CoreError> {
        let tasks = self.persistence.list_tasks_by_instance(instance_id).await?;
        Ok(tasks.into_iter().map(|t| t.id).collect())
    }

    /// Instances of a process.
    pub async fn instances(&self, process_id: i64) -> Result<Vec<InstanceRecord>, CoreError> {
        self.persistence.list_instances_by_process(process_id).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Cheap connectivity probe, surfaced as a validation error so operators
    /// see "machine unreachable" before a task is created.
    pub async fn check_machine_connection(
        &self,
        machine: &MachineRecord,
    ) -> Result<(), CoreError> {
        self.remote
            .execute_command(machine, "echo ok")
            .await
            .map_err(|e| {
                CoreError::validation(format!(
                    "machine '{}' is not reachable: {}",
                    machine.name, e
                ))
            })?;
        Ok(())
    }

    async fn process(&self, process_id: i64) -> Result<ProcessRecord, CoreError> {
        self.persistence
            .get_process(process_id)
            .await?
            .ok_or(CoreError::ProcessNotFound { process_id })
    }

    async fn instance(&self, instance_id: i64) -> Result<InstanceRecord, CoreError> {
        self.persistence
            .get_instance(instance_id)
            .await?
            .ok_or(CoreError::InstanceNotFound { instance_id })
    }

    async fn machine(&self, machine_id: i64) -> Result<MachineRecord, CoreError> {
        self.persistence
            .get_machine(machine_id)
            .await?
            .ok_or(CoreError::MachineNotFound { machine_id })
    }

    /// Load the process and the (instance, machine) pairs an operation
    /// targets. Instances must belong to the process.
    async fn resolve_targets(
        &self,
        process_id: i64,
        instance_ids: Option<&[i64]>,
    ) -> Result<(ProcessRecord, Vec<(InstanceRecord, MachineRecord)>), CoreError> {
        let process = self.process(process_id).await?;
        let all = self
            .persistence
            .list_instances_by_process(process_id)
            .await?;

        let selected: Vec<InstanceRecord> = match instance_ids {
            None => all,
            Some(ids) => {
                let mut selected = Vec::with_capacity(ids.len());
                for id in ids {
                    let instance = all.iter().find(|i| i.id == *id).cloned().ok_or_else(|| {
                        CoreError::validation(format!(
                            "instance {} does not belong to process {}",
                            id, process_id
                        ))
                    })?;
                    selected.push(instance);
                }
                selected
            }
        };
        if selected.is_empty() {
            return Err(CoreError::validation(format!(
                "process {} has no instances to operate on",
                process_id
            )));
        }

        let mut targets = Vec::with_capacity(selected.len());
        for instance in selected {
            let machine = self.machine(instance.machine_id).await?;
            targets.push((instance, machine));
        }
        Ok((process, targets))
    }

    /// Validate capabilities, create the task, and submit the standard
    /// single-sequence body.
    async fn launch_operation(
        &self,
        process: &ProcessRecord,
        targets: Vec<(InstanceRecord, MachineRecord)>,
        op: OperationType,
    ) -> Result<String, CoreError> {
        // Fail fast: no task row, no remote work, if any target denies the
        // operation.
        for (instance, _) in &targets {
            state::ensure_allowed(op, instance)?;
        }

        let instance_id = match targets.as_slice() {
            [(only, _)] => Some(only.id),
            _ => None,
        };
        let task_id = self
            .runner
            .create_task(
                process.id,
                instance_id,
                &format!("{} process [{}]", op_title(op), process.name),
                &format!("{} {} instance(s)", op_title(op), targets.len()),
                op,
                op.step_sequence(),
                &targets,
            )
            .await?;

        let state_machine = self.state_machine.clone();
        let process = process.clone();
        let body_task_id = task_id.clone();
        self.runner.submit(
            task_id.clone(),
            async move {
                let outcomes = state_machine
                    .run_operation(&body_task_id, op, &process, &targets)
                    .await?;
                Ok(outcomes.values().all(|ok| *ok))
            },
            None,
        );

        Ok(task_id)
    }
}

fn op_title(op: OperationType) -> &'static str {
    match op {
        OperationType::Initialize => "Initialize",
        OperationType::Start => "Start",
        OperationType::Stop => "Stop",
        OperationType::ForceStop => "Force-stop",
        OperationType::Restart => "Restart",
        OperationType::ScaleOut => "Scale out",
        OperationType::ScaleIn => "Scale in",
    }
}
