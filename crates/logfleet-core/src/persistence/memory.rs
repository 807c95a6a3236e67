// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! Backs the test suites and lightweight embedding scenarios where no
//! database is available. Semantics mirror the Postgres backend, including
//! the `(machine_id, deploy_path)` and `(task_id, instance_id, step_kind)`
//! uniqueness guarantees and the set-once behavior of start/end times.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::CoreError;

use super::{
    InstanceRecord, MachineRecord, NewInstance, NewMachine, NewProcess, Persistence,
    ProcessRecord, StepRecord, TaskRecord,
};

#[derive(Default)]
struct Inner {
    machines: HashMap<i64, MachineRecord>,
    processes: HashMap<i64, ProcessRecord>,
    instances: HashMap<i64, InstanceRecord>,
    tasks: HashMap<String, TaskRecord>,
    /// Steps in insertion order; identity is (task_id, instance_id, step_kind).
    steps: Vec<StepRecord>,
    next_id: i64,
}

impl Inner {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn step_mut(
        &mut self,
        task_id: &str,
        instance_id: i64,
        step_kind: &str,
    ) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| {
            s.task_id == task_id && s.instance_id == instance_id && s.step_kind == step_kind
        })
    }
}

/// In-memory persistence provider.
#[derive(Default)]
pub struct MemoryPersistence {
    inner: Mutex<Inner>,
}

impl MemoryPersistence {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn insert_machine(&self, machine: &NewMachine) -> Result<i64, CoreError> {
        let mut inner = self.inner.lock().await;
        let id = inner.allocate_id();
        inner.machines.insert(
            id,
            MachineRecord {
                id,
                name: machine.name.clone(),
                host: machine.host.clone(),
                port: machine.port,
                username: machine.username.clone(),
            },
        );
        Ok(id)
    }

    async fn get_machine(&self, machine_id: i64) -> Result<Option<MachineRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.machines.get(&machine_id).cloned())
    }

    async fn insert_process(&self, process: &NewProcess) -> Result<i64, CoreError> {
        let mut inner = self.inner.lock().await;
        if inner.processes.values().any(|p| p.name == process.name) {
            return Err(CoreError::DatabaseError {
                operation: "insert_process".to_string(),
                details: format!("duplicate process name '{}'", process.name),
            });
        }
        let id = inner.allocate_id();
        inner.processes.insert(
            id,
            ProcessRecord {
                id,
                name: process.name.clone(),
                module: process.module.clone(),
                pipeline_config: process.pipeline_config.clone(),
                jvm_options: process.jvm_options.clone(),
                deploy_base_dir: process.deploy_base_dir.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_process(&self, process_id: i64) -> Result<Option<ProcessRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.processes.get(&process_id).cloned())
    }

    async fn find_process_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ProcessRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.processes.values().find(|p| p.name == name).cloned())
    }

    async fn insert_instance(&self, instance: &NewInstance) -> Result<i64, CoreError> {
        let mut inner = self.inner.lock().await;
        // Mirror the unique index on (machine_id, deploy_path).
        if inner.instances.values().any(|i| {
            i.machine_id == instance.machine_id && i.deploy_path == instance.deploy_path
        }) {
            return Err(CoreError::DatabaseError {
                operation: "insert_instance".to_string(),
                details: format!(
                    "unique violation: (machine {}, path '{}') already occupied",
                    instance.machine_id, instance.deploy_path
                ),
            });
        }
        let id = inner.allocate_id();
        inner.instances.insert(
            id,
            InstanceRecord {
                id,
                process_id: instance.process_id,
                machine_id: instance.machine_id,
                deploy_path: instance.deploy_path.clone(),
                state: instance.state.clone(),
                pid: None,
                state_changed_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_instance(&self, instance_id: i64) -> Result<Option<InstanceRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.instances.get(&instance_id).cloned())
    }

    async fn list_instances_by_process(
        &self,
        process_id: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<InstanceRecord> = inner
            .instances
            .values()
            .filter(|i| i.process_id == process_id)
            .cloned()
            .collect();
        records.sort_by_key(|i| i.id);
        Ok(records)
    }

    async fn find_instance_by_machine_and_path(
        &self,
        machine_id: i64,
        deploy_path: &str,
    ) -> Result<Option<InstanceRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .instances
            .values()
            .find(|i| i.machine_id == machine_id && i.deploy_path == deploy_path)
            .cloned())
    }

    async fn list_instances_with_pid(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<InstanceRecord> = inner
            .instances
            .values()
            .filter(|i| i.pid.as_deref().is_some_and(|p| !p.is_empty()))
            .cloned()
            .collect();
        records.sort_by_key(|i| i.id);
        Ok(records)
    }

    async fn update_instance_state(
        &self,
        instance_id: i64,
        state: &str,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(instance) = inner.instances.get_mut(&instance_id) {
            instance.state = state.to_string();
            instance.state_changed_at = Utc::now();
        }
        Ok(())
    }

    async fn update_instance_pid(
        &self,
        instance_id: i64,
        pid: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(instance) = inner.instances.get_mut(&instance_id) {
            instance.pid = pid.map(|p| p.to_string());
        }
        Ok(())
    }

    async fn reset_instance_if_dead(
        &self,
        instance_id: i64,
        from_states: &[&str],
    ) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(instance) = inner.instances.get_mut(&instance_id)
            && instance.pid.is_some()
            && from_states.contains(&instance.state.as_str())
        {
            instance.state = "not_started".to_string();
            instance.pid = None;
            instance.state_changed_at = Utc::now();
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete_instance(&self, instance_id: i64) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        inner.instances.remove(&instance_id);
        Ok(())
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(task_id).cloned())
    }

    async fn list_tasks_by_process(
        &self,
        process_id: i64,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|t| t.process_id == process_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn list_tasks_by_instance(
        &self,
        instance_id: i64,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|t| {
                t.instance_id == Some(instance_id)
                    || inner
                        .steps
                        .iter()
                        .any(|s| s.task_id == t.id && s.instance_id == instance_id)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn update_task_status(&self, task_id: &str, status: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.status = status.to_string();
        }
        Ok(())
    }

    async fn mark_task_started(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.tasks.get_mut(task_id)
            && task.start_time.is_none()
        {
            task.start_time = Some(at);
        }
        Ok(())
    }

    async fn mark_task_finished(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.tasks.get_mut(task_id)
            && task.end_time.is_none()
        {
            task.end_time = Some(at);
            return Ok(true);
        }
        Ok(false)
    }

    async fn update_task_error(&self, task_id: &str, error: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.error_message = Some(error.to_string());
        }
        Ok(())
    }

    async fn insert_steps(&self, steps: &[StepRecord]) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        for step in steps {
            // Mirror the unique index on (task_id, instance_id, step_kind).
            if inner
                .step_mut(&step.task_id, step.instance_id, &step.step_kind)
                .is_some()
            {
                return Err(CoreError::DatabaseError {
                    operation: "insert_steps".to_string(),
                    details: format!(
                        "unique violation: step ({}, {}, {}) already exists",
                        step.task_id, step.instance_id, step.step_kind
                    ),
                });
            }
            inner.steps.push(step.clone());
        }
        Ok(())
    }

    async fn list_steps_by_task(&self, task_id: &str) -> Result<Vec<StepRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .steps
            .iter()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn update_step_status(
        &self,
        task_id: &str,
        instance_id: i64,
        step_kind: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(step) = inner.step_mut(task_id, instance_id, step_kind) {
            step.status = status.to_string();
            if let Some(error) = error {
                step.error_message = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn mark_step_started(
        &self,
        task_id: &str,
        instance_id: i64,
        step_kind: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(step) = inner.step_mut(task_id, instance_id, step_kind)
            && step.start_time.is_none()
        {
            step.start_time = Some(at);
        }
        Ok(())
    }

    async fn mark_step_finished(
        &self,
        task_id: &str,
        instance_id: i64,
        step_kind: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(step) = inner.step_mut(task_id, instance_id, step_kind)
            && step.end_time.is_none()
        {
            step.end_time = Some(at);
        }
        Ok(())
    }
}
