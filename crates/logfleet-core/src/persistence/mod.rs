// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for logfleet-core.
//!
//! This module defines the repository abstraction and record types. All row
//! mutations are single-row updates keyed by the record's identity (or, for
//! steps, the composite `(task_id, instance_id, step_kind)` key), so
//! concurrent updates from different instances and steps never collide.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryPersistence;
pub use self::postgres::PostgresPersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Machine record from the persistence layer.
///
/// Machines are referenced by instances and handed to the remote executor;
/// how they are provisioned or credentialed is outside this crate.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MachineRecord {
    /// Unique identifier for the machine.
    pub id: i64,
    /// Human-readable machine name.
    pub name: String,
    /// Hostname or IP address.
    pub host: String,
    /// SSH/agent port.
    pub port: i32,
    /// Login user for remote commands.
    pub username: String,
}

/// Process record: the logical definition of a log-shipping pipeline,
/// independent of any machine.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessRecord {
    /// Unique identifier for the process.
    pub id: i64,
    /// Unique process name.
    pub name: String,
    /// Module the process ships logs for.
    pub module: String,
    /// Pipeline configuration content (opaque to the orchestrator).
    pub pipeline_config: String,
    /// JVM options content (opaque), if any.
    pub jvm_options: Option<String>,
    /// Base directory for default instance deploy paths.
    pub deploy_base_dir: String,
    /// When the process was created.
    pub created_at: DateTime<Utc>,
}

/// Instance record: one deployment of a process onto one machine at one
/// deploy path.
///
/// Invariant: `(machine_id, deploy_path)` is unique across ALL instances -
/// this is what allows several instances of one process on a single machine,
/// as long as their paths differ.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRecord {
    /// Unique identifier for the instance.
    pub id: i64,
    /// Owning process.
    pub process_id: i64,
    /// Machine this instance is deployed on.
    pub machine_id: i64,
    /// Absolute deploy directory on the machine.
    pub deploy_path: String,
    /// Current lifecycle state (see [`crate::state::InstanceState`]).
    pub state: String,
    /// Recorded PID of the remote shipper process, if running.
    pub pid: Option<String>,
    /// When the state last changed. The reconciler's grace window keys off
    /// this timestamp.
    pub state_changed_at: DateTime<Utc>,
}

/// Task record: one orchestrated operation targeting one or more instances.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRecord {
    /// Opaque task identifier (UUID).
    pub id: String,
    /// Owning process.
    pub process_id: i64,
    /// Target instance for per-instance tasks; None for process-wide tasks
    /// that fan out to several instances.
    pub instance_id: Option<i64>,
    /// Human-readable task name.
    pub name: String,
    /// Longer description.
    pub description: String,
    /// Operation type (see [`crate::state::OperationType`]).
    pub operation_type: String,
    /// Current status (pending, running, completed, failed, cancelled).
    pub status: String,
    /// When execution began.
    pub start_time: Option<DateTime<Utc>>,
    /// When execution reached a terminal status. Set exactly once.
    pub end_time: Option<DateTime<Utc>>,
    /// Error message from a failed run.
    pub error_message: Option<String>,
    /// When the task row was created.
    pub created_at: DateTime<Utc>,
}

/// Step record: one unit of remote work within a task, scoped to exactly one
/// instance. Identified by `(task_id, instance_id, step_kind)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRecord {
    /// Owning task.
    pub task_id: String,
    /// Target instance.
    pub instance_id: i64,
    /// Machine the instance lives on. Display only - the instance row is the
    /// source of truth for placement.
    pub machine_id: i64,
    /// Step kind identifier (see [`crate::steps::StepKind`]).
    pub step_kind: String,
    /// Human-readable step name.
    pub step_name: String,
    /// Current status (pending, running, completed, failed, skipped).
    pub status: String,
    /// When the step started executing.
    pub start_time: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Error message from a failed step.
    pub error_message: Option<String>,
}

/// Fields for inserting a new machine.
#[derive(Debug, Clone)]
pub struct NewMachine {
    /// Human-readable machine name.
    pub name: String,
    /// Hostname or IP address.
    pub host: String,
    /// SSH/agent port.
    pub port: i32,
    /// Login user for remote commands.
    pub username: String,
}

/// Fields for inserting a new process.
#[derive(Debug, Clone)]
pub struct NewProcess {
    /// Unique process name.
    pub name: String,
    /// Module the process ships logs for.
    pub module: String,
    /// Pipeline configuration content.
    pub pipeline_config: String,
    /// JVM options content, if any.
    pub jvm_options: Option<String>,
    /// Base directory for default instance deploy paths.
    pub deploy_base_dir: String,
}

/// Fields for inserting a new instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    /// Owning process.
    pub process_id: i64,
    /// Machine the instance is deployed on.
    pub machine_id: i64,
    /// Absolute deploy directory on the machine.
    pub deploy_path: String,
    /// Initial lifecycle state.
    pub state: String,
}

/// Task status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created, not yet picked up by the worker pool.
    Pending,
    /// Task body is executing.
    Running,
    /// Every instance completed every step.
    Completed,
    /// At least one instance's step sequence short-circuited.
    Failed,
    /// Task was cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// Storage string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a storage string back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this status is terminal. Terminal statuses never change again
    /// and fix the task's end time.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Step status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Created, not yet started.
    Pending,
    /// Remote work in flight.
    Running,
    /// Remote work succeeded.
    Completed,
    /// Remote work failed; the owning instance's sequence short-circuits.
    Failed,
    /// Never executed because an earlier step for the same instance failed.
    Skipped,
}

impl StepStatus {
    /// Storage string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parse a storage string back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Repository interface used by the orchestration engine.
///
/// Implementations must make every update atomic at the row level. The
/// `(machine_id, deploy_path)` uniqueness check in the scaling path should be
/// backed by a unique constraint in the store to close the check-then-insert
/// race window.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Machines
    // ========================================================================

    /// Insert a machine and return its id.
    async fn insert_machine(&self, machine: &NewMachine) -> Result<i64, CoreError>;

    /// Get a machine by id.
    async fn get_machine(&self, machine_id: i64) -> Result<Option<MachineRecord>, CoreError>;

    // ========================================================================
    // Processes
    // ========================================================================

    /// Insert a process and return its id.
    async fn insert_process(&self, process: &NewProcess) -> Result<i64, CoreError>;

    /// Get a process by id.
    async fn get_process(&self, process_id: i64) -> Result<Option<ProcessRecord>, CoreError>;

    /// Find a process by its unique name.
    async fn find_process_by_name(&self, name: &str)
    -> Result<Option<ProcessRecord>, CoreError>;

    // ========================================================================
    // Instances
    // ========================================================================

    /// Insert an instance and return its id.
    ///
    /// Fails if `(machine_id, deploy_path)` is already occupied.
    async fn insert_instance(&self, instance: &NewInstance) -> Result<i64, CoreError>;

    /// Get an instance by id.
    async fn get_instance(&self, instance_id: i64) -> Result<Option<InstanceRecord>, CoreError>;

    /// List all instances belonging to a process.
    async fn list_instances_by_process(
        &self,
        process_id: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Find the instance occupying `(machine_id, deploy_path)`, if any.
    async fn find_instance_by_machine_and_path(
        &self,
        machine_id: i64,
        deploy_path: &str,
    ) -> Result<Option<InstanceRecord>, CoreError>;

    /// List all instances carrying a non-empty recorded PID, across all
    /// processes. This is the reconciler's sweep input.
    async fn list_instances_with_pid(&self) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Update an instance's state and bump its `state_changed_at` timestamp.
    async fn update_instance_state(&self, instance_id: i64, state: &str)
    -> Result<(), CoreError>;

    /// Update (or clear) an instance's recorded PID.
    async fn update_instance_pid(
        &self,
        instance_id: i64,
        pid: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Atomically clear the PID and reset the state to `not_started`, but
    /// only while the instance is still in one of `from_states`. Returns true
    /// if the update was applied.
    ///
    /// This is the reconciler's self-heal primitive: the state guard prevents
    /// racing an operator-initiated transition that happened between the
    /// probe and the write.
    async fn reset_instance_if_dead(
        &self,
        instance_id: i64,
        from_states: &[&str],
    ) -> Result<bool, CoreError>;

    /// Delete an instance row. Task/step history referencing the instance is
    /// deliberately retained.
    async fn delete_instance(&self, instance_id: i64) -> Result<(), CoreError>;

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Insert a task row.
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError>;

    /// Get a task by id.
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError>;

    /// List tasks for a process, newest first.
    async fn list_tasks_by_process(&self, process_id: i64)
    -> Result<Vec<TaskRecord>, CoreError>;

    /// List tasks targeting a specific instance, newest first.
    async fn list_tasks_by_instance(
        &self,
        instance_id: i64,
    ) -> Result<Vec<TaskRecord>, CoreError>;

    /// Update a task's status string.
    async fn update_task_status(&self, task_id: &str, status: &str) -> Result<(), CoreError>;

    /// Set the task's start time if it is not already set.
    async fn mark_task_started(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Set the task's end time if it is not already set. Returns true if the
    /// write was applied - the end time is set exactly once, at the first
    /// terminal transition.
    async fn mark_task_finished(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Record an error message on the task.
    async fn update_task_error(&self, task_id: &str, error: &str) -> Result<(), CoreError>;

    // ========================================================================
    // Steps
    // ========================================================================

    /// Insert step rows. Called once per task, before any remote work, in the
    /// operation's fixed step order.
    async fn insert_steps(&self, steps: &[StepRecord]) -> Result<(), CoreError>;

    /// List all steps belonging to a task, in insertion order.
    async fn list_steps_by_task(&self, task_id: &str) -> Result<Vec<StepRecord>, CoreError>;

    /// Update one step's status and error message, keyed by the composite
    /// `(task_id, instance_id, step_kind)` identity.
    async fn update_step_status(
        &self,
        task_id: &str,
        instance_id: i64,
        step_kind: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Set a step's start time if it is not already set.
    async fn mark_step_started(
        &self,
        task_id: &str,
        instance_id: i64,
        step_kind: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Set a step's end time if it is not already set.
    async fn mark_step_finished(
        &self,
        task_id: &str,
        instance_id: i64,
        step_kind: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_step_status_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
    }
}
