// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scaling controller: add and remove instances for a process.
//!
//! Scale-out resolves a deploy path per target machine, refuses paths that
//! are already occupied, creates the instance records, and runs the
//! initialize+start sequence for the new batch. Scale-in enforces the
//! minimum-one invariant, refuses to remove live instances unless forced,
//! force-stops best-effort when it is, deletes the remote directories, and
//! finally deletes the instance records.
//!
//! Task and step history for removed instances is retained - removal takes
//! the instance row, not its audit trail.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::persistence::{
    InstanceRecord, MachineRecord, NewInstance, Persistence, ProcessRecord,
};
use crate::remote::RemoteExecutor;
use crate::state::{
    InstanceState, OperationType, SCALE_IN_SEQUENCE, SCALE_OUT_SEQUENCE, StateMachine,
};
use crate::steps::{INITIALIZE_SEQUENCE, START_SEQUENCE, STOP_SEQUENCE, StepKind, StepTimings};
use crate::paths;
use crate::task::TaskRunner;

/// A scale request. Exactly one of `add_machine_ids` / `remove_instance_ids`
/// must be non-empty.
#[derive(Debug, Clone, Default)]
pub struct ScaleRequest {
    /// Machines to add one instance each to (scale-out).
    pub add_machine_ids: Vec<i64>,
    /// Instances to remove (scale-in).
    pub remove_instance_ids: Vec<i64>,
    /// Explicit deploy path for the new instances. Blank means the default
    /// `{deploy_base_dir}/shipper-{process_id}` path.
    pub custom_deploy_path: Option<String>,
    /// Scale-in override: stop RUNNING/STOP_FAILED targets best-effort and
    /// remove them regardless of the stop outcome.
    pub force: bool,
}

impl ScaleRequest {
    /// Whether this is a scale-out request.
    pub fn is_scale_out(&self) -> bool {
        !self.add_machine_ids.is_empty()
    }

    /// Whether this is a scale-in request.
    pub fn is_scale_in(&self) -> bool {
        !self.remove_instance_ids.is_empty()
    }

    /// Validate the request shape: exactly one direction must be set.
    pub fn validate(&self) -> Result<(), CoreError> {
        match (self.is_scale_out(), self.is_scale_in()) {
            (true, true) => Err(CoreError::validation(
                "a scale request cannot both add machines and remove instances",
            )),
            (false, false) => Err(CoreError::validation(
                "a scale request must either add machines or remove instances",
            )),
            _ => Ok(()),
        }
    }
}

/// Executes validated scale requests.
pub struct ScaleController {
    persistence: Arc<dyn Persistence>,
    remote: Arc<dyn RemoteExecutor>,
    runner: Arc<TaskRunner>,
    state_machine: Arc<StateMachine>,
    config: Config,
    timings: StepTimings,
}

impl ScaleController {
    /// Create a scale controller over the given collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        remote: Arc<dyn RemoteExecutor>,
        runner: Arc<TaskRunner>,
        state_machine: Arc<StateMachine>,
        config: Config,
        timings: StepTimings,
    ) -> Self {
        Self {
            persistence,
            remote,
            runner,
            state_machine,
            config,
            timings,
        }
    }

    /// Execute a scale request against a process. Validation happens
    /// synchronously (nothing is mutated on a validation error); the remote
    /// work runs asynchronously under the returned task id.
    pub async fn scale(
        &self,
        process: &ProcessRecord,
        request: &ScaleRequest,
    ) -> Result<String, CoreError> {
        request.validate()?;
        if request.is_scale_out() {
            self.scale_out(
                process,
                &request.add_machine_ids,
                request.custom_deploy_path.as_deref(),
            )
            .await
        } else {
            self.scale_in(process, &request.remove_instance_ids, request.force)
                .await
        }
    }

    /// Resolve the deploy path for a new instance on a machine.
    fn resolve_deploy_path(&self, process: &ProcessRecord, custom: Option<&str>) -> String {
        match custom.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => path.to_string(),
            None => paths::default_instance_dir(&process.deploy_base_dir, process.id),
        }
    }

    /// Create one NOT_STARTED instance per machine, after checking that no
    /// existing instance occupies any target `(machine, path)` pair.
    ///
    /// All targets are validated before the first row is inserted, so a
    /// conflicting request creates nothing.
    pub async fn create_instances_checked(
        &self,
        process: &ProcessRecord,
        machines: &[MachineRecord],
        custom_deploy_path: Option<&str>,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let mut planned: Vec<(i64, String)> = Vec::with_capacity(machines.len());
        for machine in machines {
            let deploy_path = self.resolve_deploy_path(process, custom_deploy_path);
            if let Some(existing) = self
                .persistence
                .find_instance_by_machine_and_path(machine.id, &deploy_path)
                .await?
            {
                return Err(CoreError::PathConflict {
                    machine_id: machine.id,
                    deploy_path,
                    occupied_by_instance: existing.id,
                    occupied_by_process: existing.process_id,
                });
            }
            if planned.contains(&(machine.id, deploy_path.clone())) {
                return Err(CoreError::validation(format!(
                    "machine {} appears twice with deploy path '{}'",
                    machine.id, deploy_path
                )));
            }
            planned.push((machine.id, deploy_path));
        }

        let mut created = Vec::with_capacity(planned.len());
        for (machine_id, deploy_path) in planned {
            let id = self
                .persistence
                .insert_instance(&NewInstance {
                    process_id: process.id,
                    machine_id,
                    deploy_path: deploy_path.clone(),
                    state: InstanceState::NotStarted.as_str().to_string(),
                })
                .await?;
            let record = self
                .persistence
                .get_instance(id)
                .await?
                .ok_or(CoreError::InstanceNotFound { instance_id: id })?;
            info!(
                process_id = process.id,
                instance_id = id,
                machine_id,
                deploy_path = %deploy_path,
                "instance created"
            );
            created.push(record);
        }
        Ok(created)
    }

    async fn scale_out(
        &self,
        process: &ProcessRecord,
        machine_ids: &[i64],
        custom_deploy_path: Option<&str>,
    ) -> Result<String, CoreError> {
        let mut machines = Vec::with_capacity(machine_ids.len());
        for machine_id in machine_ids {
            let machine = self
                .persistence
                .get_machine(*machine_id)
                .await?
                .ok_or(CoreError::MachineNotFound {
                    machine_id: *machine_id,
                })?;
            machines.push(machine);
        }

        let instances = self
            .create_instances_checked(process, &machines, custom_deploy_path)
            .await?;
        let targets: Vec<(InstanceRecord, MachineRecord)> = instances
            .into_iter()
            .zip(machines.into_iter())
            .collect();

        let task_id = self
            .runner
            .create_task(
                process.id,
                None,
                &format!("Scale out process [{}]", process.name),
                &format!("Deploy and start {} new instance(s)", targets.len()),
                OperationType::ScaleOut,
                SCALE_OUT_SEQUENCE,
                &targets,
            )
            .await?;

        let state_machine = self.state_machine.clone();
        let runner = self.runner.clone();
        let persistence = self.persistence.clone();
        let body_process = process.clone();
        let body_task_id = task_id.clone();
        self.runner.submit(
            task_id.clone(),
            async move {
                scale_out_body(
                    state_machine,
                    runner,
                    persistence,
                    &body_task_id,
                    &body_process,
                    targets,
                )
                .await
            },
            None,
        );

        info!(process_id = process.id, task_id = %task_id, "scale-out submitted");
        Ok(task_id)
    }

    async fn scale_in(
        &self,
        process: &ProcessRecord,
        instance_ids: &[i64],
        force: bool,
    ) -> Result<String, CoreError> {
        let all_instances = self
            .persistence
            .list_instances_by_process(process.id)
            .await?;
        if all_instances.len() <= instance_ids.len() {
            return Err(CoreError::MinimumInstances {
                process_id: process.id,
                current: all_instances.len(),
                removing: instance_ids.len(),
            });
        }

        let mut targets: Vec<(InstanceRecord, MachineRecord)> =
            Vec::with_capacity(instance_ids.len());
        for instance_id in instance_ids {
            let instance = all_instances
                .iter()
                .find(|i| i.id == *instance_id)
                .cloned()
                .ok_or_else(|| {
                    CoreError::validation(format!(
                        "instance {} does not belong to process {}",
                        instance_id, process.id
                    ))
                })?;
            let machine = self
                .persistence
                .get_machine(instance.machine_id)
                .await?
                .ok_or(CoreError::MachineNotFound {
                    machine_id: instance.machine_id,
                })?;
            targets.push((instance, machine));
        }

        let live: Vec<i64> = targets
            .iter()
            .filter(|(instance, _)| is_live(instance))
            .map(|(instance, _)| instance.id)
            .collect();
        if !force && !live.is_empty() {
            // Fail before mutating anything: the whole request is rejected.
            return Err(CoreError::validation(format!(
                "instances {:?} are running or stop-failed; stop them first or set force",
                live
            )));
        }

        let task_id = self
            .runner
            .create_task(
                process.id,
                None,
                &format!("Scale in process [{}]", process.name),
                &format!("Remove {} instance(s)", targets.len()),
                OperationType::ScaleIn,
                SCALE_IN_SEQUENCE,
                &targets,
            )
            .await?;

        let state_machine = self.state_machine.clone();
        let runner = self.runner.clone();
        let persistence = self.persistence.clone();
        let remote = self.remote.clone();
        let config = self.config.clone();
        let timings = self.timings.clone();
        let body_process = process.clone();
        let body_task_id = task_id.clone();
        self.runner.submit(
            task_id.clone(),
            async move {
                scale_in_body(
                    state_machine,
                    runner,
                    persistence,
                    remote,
                    config,
                    timings,
                    &body_task_id,
                    &body_process,
                    targets,
                )
                .await
            },
            None,
        );

        info!(process_id = process.id, task_id = %task_id, force, "scale-in submitted");
        Ok(task_id)
    }
}

fn is_live(instance: &InstanceRecord) -> bool {
    matches!(
        InstanceState::parse(&instance.state),
        Some(InstanceState::Running) | Some(InstanceState::StopFailed)
    )
}

/// Re-read the instance rows of `targets` so later halves of a composite
/// operation see the states written by earlier halves.
async fn refresh_targets(
    persistence: &dyn Persistence,
    targets: Vec<(InstanceRecord, MachineRecord)>,
) -> Result<Vec<(InstanceRecord, MachineRecord)>, CoreError> {
    let mut refreshed = Vec::with_capacity(targets.len());
    for (instance, machine) in targets {
        let record = persistence
            .get_instance(instance.id)
            .await?
            .unwrap_or(instance);
        refreshed.push((record, machine));
    }
    Ok(refreshed)
}

async fn scale_out_body(
    state_machine: Arc<StateMachine>,
    runner: Arc<TaskRunner>,
    persistence: Arc<dyn Persistence>,
    task_id: &str,
    process: &ProcessRecord,
    targets: Vec<(InstanceRecord, MachineRecord)>,
) -> Result<bool, CoreError> {
    let init_outcomes = state_machine
        .run_steps_with_transitions(
            task_id,
            OperationType::Initialize,
            INITIALIZE_SEQUENCE,
            process,
            &targets,
        )
        .await?;

    let (initialized, failed): (Vec<_>, Vec<_>) = targets
        .into_iter()
        .partition(|(instance, _)| init_outcomes.get(&instance.id).copied().unwrap_or(false));

    for (instance, _) in &failed {
        runner.skip_steps(task_id, instance.id, START_SEQUENCE).await;
    }

    if initialized.is_empty() {
        return Ok(false);
    }

    let refreshed = refresh_targets(persistence.as_ref(), initialized).await?;
    let start_outcomes = state_machine
        .run_steps_with_transitions(
            task_id,
            OperationType::Start,
            START_SEQUENCE,
            process,
            &refreshed,
        )
        .await?;

    Ok(failed.is_empty() && start_outcomes.values().all(|ok| *ok))
}

#[allow(clippy::too_many_arguments)]
async fn scale_in_body(
    state_machine: Arc<StateMachine>,
    runner: Arc<TaskRunner>,
    persistence: Arc<dyn Persistence>,
    remote: Arc<dyn RemoteExecutor>,
    config: Config,
    timings: StepTimings,
    task_id: &str,
    process: &ProcessRecord,
    targets: Vec<(InstanceRecord, MachineRecord)>,
) -> Result<bool, CoreError> {
    let (live, idle): (Vec<_>, Vec<_>) = targets
        .into_iter()
        .partition(|(instance, _)| is_live(instance));

    // Best-effort force-stop: removal proceeds whatever the stop commands did.
    let mut stop_clean = true;
    if !live.is_empty() {
        let outcomes = state_machine
            .run_steps_with_transitions(
                task_id,
                OperationType::ForceStop,
                STOP_SEQUENCE,
                process,
                &live,
            )
            .await?;
        stop_clean = outcomes.values().all(|ok| *ok);
        if !stop_clean {
            warn!(task_id, "force-stop left failures; removing instances anyway");
        }
    }
    for (instance, _) in &idle {
        runner.skip_steps(task_id, instance.id, STOP_SEQUENCE).await;
    }

    let all_targets: Vec<(InstanceRecord, MachineRecord)> =
        live.into_iter().chain(idle.into_iter()).collect();
    let all_targets = refresh_targets(persistence.as_ref(), all_targets).await?;

    let delete_outcomes = runner
        .run_sequence(
            task_id,
            &[StepKind::DeleteDirectory],
            process,
            &all_targets,
            remote.as_ref(),
            &config,
            &timings,
        )
        .await?;

    // Instance rows go away regardless; task/step history stays.
    for (instance, _) in &all_targets {
        persistence.delete_instance(instance.id).await?;
        info!(task_id, instance_id = instance.id, "instance removed");
    }

    Ok(stop_clean && delete_outcomes.values().all(|ok| *ok))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_request_validation() {
        let both = ScaleRequest {
            add_machine_ids: vec![1],
            remove_instance_ids: vec![2],
            ..Default::default()
        };
        assert!(both.validate().is_err());

        let neither = ScaleRequest::default();
        assert!(neither.validate().is_err());

        let add = ScaleRequest {
            add_machine_ids: vec![1],
            ..Default::default()
        };
        assert!(add.validate().is_ok());
        assert!(add.is_scale_out());

        let remove = ScaleRequest {
            remove_instance_ids: vec![2],
            force: true,
            ..Default::default()
        };
        assert!(remove.validate().is_ok());
        assert!(remove.is_scale_in());
    }
}
