// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task and step execution framework.
//!
//! A task is one orchestrated operation against one or more instances. Its
//! step rows are written PENDING up front, in the operation's fixed step
//! order, before any remote work begins; each transition is written back
//! synchronously so external observers see live progress.
//!
//! Execution contract: steps run **in step order**, and within each step the
//! targeted instances run **concurrently**, joined with a barrier before the
//! next step. An instance whose step fails is short-circuited - its
//! remaining steps are recorded SKIPPED and never executed - while the other
//! instances continue. The task completes only if every instance completed
//! every step.
//!
//! Task bodies run on a bounded worker pool; submission returns immediately
//! and the caller polls task/step status. An optional completion callback
//! always runs, whatever exit path the body took (success, failure, panic).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::CoreError;
use crate::persistence::{
    InstanceRecord, MachineRecord, Persistence, ProcessRecord, StepRecord, StepStatus,
    TaskRecord, TaskStatus,
};
use crate::remote::RemoteExecutor;
use crate::state::OperationType;
use crate::steps::{self, StepContext, StepDeps, StepKind, StepTimings};

/// Completion hook invoked after a task body finishes, on every exit path.
pub type TaskCallback = Box<dyn FnOnce() + Send + 'static>;

/// Creates task/step records and executes task bodies on a bounded pool.
pub struct TaskRunner {
    persistence: Arc<dyn Persistence>,
    pool: Arc<Semaphore>,
}

impl TaskRunner {
    /// Create a task runner executing at most `max_concurrent_tasks` bodies
    /// at a time.
    pub fn new(persistence: Arc<dyn Persistence>, max_concurrent_tasks: usize) -> Self {
        Self {
            persistence,
            pool: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
        }
    }

    /// Create a task row plus one PENDING step row per (instance × step
    /// kind), in step order. Returns the new task id.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_task(
        &self,
        process_id: i64,
        instance_id: Option<i64>,
        name: &str,
        description: &str,
        op: OperationType,
        kinds: &[StepKind],
        targets: &[(InstanceRecord, MachineRecord)],
    ) -> Result<String, CoreError> {
        let task_id = Uuid::new_v4().to_string();
        let task = TaskRecord {
            id: task_id.clone(),
            process_id,
            instance_id,
            name: name.to_string(),
            description: description.to_string(),
            operation_type: op.as_str().to_string(),
            status: TaskStatus::Pending.as_str().to_string(),
            start_time: None,
            end_time: None,
            error_message: None,
            created_at: Utc::now(),
        };
        self.persistence.insert_task(&task).await?;

        let mut step_rows = Vec::with_capacity(targets.len() * kinds.len());
        for (instance, machine) in targets {
            for kind in kinds {
                step_rows.push(StepRecord {
                    task_id: task_id.clone(),
                    instance_id: instance.id,
                    machine_id: machine.id,
                    step_kind: kind.id().to_string(),
                    step_name: kind.display_name().to_string(),
                    status: StepStatus::Pending.as_str().to_string(),
                    start_time: None,
                    end_time: None,
                    error_message: None,
                });
            }
        }
        self.persistence.insert_steps(&step_rows).await?;

        info!(
            task_id = %task_id,
            process_id,
            operation = op.as_str(),
            instances = targets.len(),
            steps = step_rows.len(),
            "task created"
        );
        Ok(task_id)
    }

    /// Submit a task body for asynchronous execution.
    ///
    /// The body resolves to the task's overall success. The task is marked
    /// RUNNING when a pool slot is acquired, and COMPLETED/FAILED when the
    /// body resolves; a body that errors or panics marks the task FAILED
    /// with the error recorded. `callback`, when given, runs exactly once
    /// after the terminal status is written, on every exit path.
    pub fn submit<F>(&self, task_id: String, body: F, callback: Option<TaskCallback>)
    where
        F: Future<Output = Result<bool, CoreError>> + Send + 'static,
    {
        let persistence = self.persistence.clone();
        let pool = self.pool.clone();

        tokio::spawn(async move {
            // Closed-semaphore means the runtime is shutting down; run anyway
            // so the task record still reaches a terminal state.
            let _permit = pool.acquire_owned().await.ok();

            if let Err(e) =
                set_task_status(persistence.as_ref(), &task_id, TaskStatus::Running).await
            {
                error!(task_id = %task_id, error = %e, "failed to mark task running");
            }

            // The body runs in its own task so a panic is contained and
            // still reaches the terminal-status and callback paths below.
            let result = tokio::spawn(body).await;

            let terminal = match result {
                Ok(Ok(success)) => {
                    if success {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    }
                }
                Ok(Err(e)) => {
                    error!(task_id = %task_id, error = %e, "task body failed");
                    if let Err(e) = persistence.update_task_error(&task_id, &e.to_string()).await
                    {
                        error!(task_id = %task_id, error = %e, "failed to record task error");
                    }
                    TaskStatus::Failed
                }
                Err(join_error) => {
                    error!(task_id = %task_id, error = %join_error, "task body panicked");
                    let message = format!("task body panicked: {}", join_error);
                    if let Err(e) = persistence.update_task_error(&task_id, &message).await {
                        error!(task_id = %task_id, error = %e, "failed to record task error");
                    }
                    TaskStatus::Failed
                }
            };

            if let Err(e) = set_task_status(persistence.as_ref(), &task_id, terminal).await {
                error!(task_id = %task_id, error = %e, "failed to mark task terminal");
            }

            if let Some(callback) = callback {
                callback();
            }
        });
    }

    /// Execute `kinds` in order for `targets` under `task_id`.
    ///
    /// Within each kind the active instances fan out concurrently and are
    /// joined before the next kind begins. Instances short-circuited by an
    /// earlier failure have their remaining steps recorded SKIPPED. Returns
    /// the per-instance success map.
    ///
    /// Step-status write failures are logged and do not abort the sweep -
    /// losing a progress write must never cancel remote work mid-flight.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_sequence(
        &self,
        task_id: &str,
        kinds: &[StepKind],
        process: &ProcessRecord,
        targets: &[(InstanceRecord, MachineRecord)],
        remote: &dyn RemoteExecutor,
        config: &Config,
        timings: &StepTimings,
    ) -> Result<HashMap<i64, bool>, CoreError> {
        let mut active: HashMap<i64, bool> =
            targets.iter().map(|(i, _)| (i.id, true)).collect();

        for kind in kinds.iter().copied() {
            for (instance, _) in targets {
                if !active[&instance.id] {
                    self.record_step(task_id, instance.id, kind, StepStatus::Skipped, None)
                        .await;
                }
            }

            let in_flight: Vec<_> = targets
                .iter()
                .filter(|(instance, _)| active[&instance.id])
                .map(|(instance, machine)| {
                    let persistence = self.persistence.clone();
                    async move {
                        if let Err(e) = persistence
                            .update_step_status(
                                task_id,
                                instance.id,
                                kind.id(),
                                StepStatus::Running.as_str(),
                                None,
                            )
                            .await
                        {
                            warn!(task_id, instance_id = instance.id, error = %e, "step status write failed");
                        }
                        if let Err(e) = persistence
                            .mark_step_started(task_id, instance.id, kind.id(), Utc::now())
                            .await
                        {
                            warn!(task_id, instance_id = instance.id, error = %e, "step start-time write failed");
                        }

                        let ctx = StepContext {
                            instance,
                            process,
                            machine,
                        };
                        let deps = StepDeps {
                            remote,
                            persistence: persistence.as_ref(),
                            config,
                            timings,
                        };
                        let outcome = steps::run_step(kind, &ctx, &deps).await;

                        let status = if outcome.success {
                            StepStatus::Completed
                        } else {
                            StepStatus::Failed
                        };
                        if let Err(e) = persistence
                            .update_step_status(
                                task_id,
                                instance.id,
                                kind.id(),
                                status.as_str(),
                                outcome.error.as_deref(),
                            )
                            .await
                        {
                            warn!(task_id, instance_id = instance.id, error = %e, "step status write failed");
                        }
                        if let Err(e) = persistence
                            .mark_step_finished(task_id, instance.id, kind.id(), Utc::now())
                            .await
                        {
                            warn!(task_id, instance_id = instance.id, error = %e, "step end-time write failed");
                        }

                        (instance.id, outcome.success)
                    }
                })
                .collect();

            // Barrier: every instance finishes this kind before the next begins.
            for (instance_id, success) in join_all(in_flight).await {
                if !success {
                    active.insert(instance_id, false);
                }
            }
        }

        Ok(active)
    }

    /// Record the given steps SKIPPED for one instance. Used by composite
    /// operations when an earlier half already failed.
    pub async fn skip_steps(&self, task_id: &str, instance_id: i64, kinds: &[StepKind]) {
        for kind in kinds {
            self.record_step(task_id, instance_id, *kind, StepStatus::Skipped, None)
                .await;
        }
    }

    async fn record_step(
        &self,
        task_id: &str,
        instance_id: i64,
        kind: StepKind,
        status: StepStatus,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .persistence
            .update_step_status(task_id, instance_id, kind.id(), status.as_str(), error)
            .await
        {
            warn!(task_id, instance_id, error = %e, "step status write failed");
        }
        if status.is_terminal() {
            if let Err(e) = self
                .persistence
                .mark_step_finished(task_id, instance_id, kind.id(), Utc::now())
                .await
            {
                warn!(task_id, instance_id, error = %e, "step end-time write failed");
            }
        }
    }
}

/// Apply a status to a task, maintaining the monotonic transition contract:
/// a terminal status is never overwritten, the start time is stamped on the
/// first RUNNING transition, and the end time exactly once at the first
/// terminal transition.
pub async fn set_task_status(
    persistence: &dyn Persistence,
    task_id: &str,
    status: TaskStatus,
) -> Result<(), CoreError> {
    let task = persistence
        .get_task(task_id)
        .await?
        .ok_or_else(|| CoreError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;

    if let Some(current) = TaskStatus::parse(&task.status)
        && current.is_terminal()
    {
        return Ok(());
    }

    persistence
        .update_task_status(task_id, status.as_str())
        .await?;
    if status == TaskStatus::Running {
        persistence.mark_task_started(task_id, Utc::now()).await?;
    }
    if status.is_terminal() {
        persistence.mark_task_finished(task_id, Utc::now()).await?;
    }
    Ok(())
}

// ============================================================================
// Task detail (read-only progress view)
// ============================================================================

/// One step as shown in progress displays.
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    /// Step kind identifier.
    pub step_kind: String,
    /// Human-readable step name.
    pub step_name: String,
    /// Current status string.
    pub status: String,
    /// Machine the step targets (display only).
    pub machine_id: i64,
    /// When the step started.
    pub start_time: Option<chrono::DateTime<Utc>>,
    /// When the step finished.
    pub end_time: Option<chrono::DateTime<Utc>>,
    /// Error message for failed steps.
    pub error_message: Option<String>,
}

/// Aggregate step counts for progress bars.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StepCounts {
    /// Steps completed successfully.
    pub completed: usize,
    /// Steps that failed.
    pub failed: usize,
    /// Steps not yet started.
    pub pending: usize,
    /// Steps currently in flight.
    pub running: usize,
    /// Steps skipped by a short-circuit.
    pub skipped: usize,
}

/// Read-only task progress: the task row plus its steps grouped by instance.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    /// Task identifier.
    pub task_id: String,
    /// Owning process.
    pub process_id: i64,
    /// Target instance for per-instance tasks.
    pub instance_id: Option<i64>,
    /// Task name.
    pub name: String,
    /// Task description.
    pub description: String,
    /// Operation type string.
    pub operation_type: String,
    /// Current status string.
    pub status: String,
    /// When execution began.
    pub start_time: Option<chrono::DateTime<Utc>>,
    /// When execution reached a terminal status.
    pub end_time: Option<chrono::DateTime<Utc>>,
    /// Error message from a failed run.
    pub error_message: Option<String>,
    /// Steps grouped by instance id, in step order.
    pub instance_steps: HashMap<i64, Vec<StepView>>,
    /// Total number of steps across all instances.
    pub total_steps: usize,
    /// Aggregate step counts.
    pub counts: StepCounts,
}

/// Load the progress view for a task, or None if the task does not exist.
pub async fn get_task_detail(
    persistence: &dyn Persistence,
    task_id: &str,
) -> Result<Option<TaskDetail>, CoreError> {
    let Some(task) = persistence.get_task(task_id).await? else {
        return Ok(None);
    };
    let step_rows = persistence.list_steps_by_task(task_id).await?;

    let mut instance_steps: HashMap<i64, Vec<StepView>> = HashMap::new();
    let mut counts = StepCounts::default();
    for step in &step_rows {
        match StepStatus::parse(&step.status) {
            Some(StepStatus::Completed) => counts.completed += 1,
            Some(StepStatus::Failed) => counts.failed += 1,
            Some(StepStatus::Running) => counts.running += 1,
            Some(StepStatus::Skipped) => counts.skipped += 1,
            Some(StepStatus::Pending) | None => counts.pending += 1,
        }
        instance_steps
            .entry(step.instance_id)
            .or_default()
            .push(StepView {
                step_kind: step.step_kind.clone(),
                step_name: step.step_name.clone(),
                status: step.status.clone(),
                machine_id: step.machine_id,
                start_time: step.start_time,
                end_time: step.end_time,
                error_message: step.error_message.clone(),
            });
    }

    Ok(Some(TaskDetail {
        task_id: task.id,
        process_id: task.process_id,
        instance_id: task.instance_id,
        name: task.name,
        description: task.description,
        operation_type: task.operation_type,
        status: task.status,
        start_time: task.start_time,
        end_time: task.end_time,
        error_message: task.error_message,
        instance_steps,
        total_steps: step_rows.len(),
        counts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;

    async fn seeded_task(store: &Arc<MemoryPersistence>) -> String {
        let task = TaskRecord {
            id: "t1".to_string(),
            process_id: 1,
            instance_id: None,
            name: "start".to_string(),
            description: "".to_string(),
            operation_type: "start".to_string(),
            status: "pending".to_string(),
            start_time: None,
            end_time: None,
            error_message: None,
            created_at: Utc::now(),
        };
        store.insert_task(&task).await.unwrap();
        "t1".to_string()
    }

    #[tokio::test]
    async fn test_status_monotonic() {
        let store = Arc::new(MemoryPersistence::new());
        let task_id = seeded_task(&store).await;

        set_task_status(store.as_ref(), &task_id, TaskStatus::Running)
            .await
            .unwrap();
        set_task_status(store.as_ref(), &task_id, TaskStatus::Failed)
            .await
            .unwrap();
        // A terminal status is never overwritten.
        set_task_status(store.as_ref(), &task_id, TaskStatus::Completed)
            .await
            .unwrap();

        let task = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, "failed");
        assert!(task.start_time.is_some());
        assert!(task.end_time.is_some());
    }

    #[tokio::test]
    async fn test_end_time_set_once() {
        let store = Arc::new(MemoryPersistence::new());
        let task_id = seeded_task(&store).await;

        set_task_status(store.as_ref(), &task_id, TaskStatus::Failed)
            .await
            .unwrap();
        let first_end = store
            .get_task(&task_id)
            .await
            .unwrap()
            .unwrap()
            .end_time
            .unwrap();

        set_task_status(store.as_ref(), &task_id, TaskStatus::Completed)
            .await
            .unwrap();
        let task = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.end_time, Some(first_end));
    }

    #[tokio::test]
    async fn test_submit_runs_callback_on_success_and_failure() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = Arc::new(MemoryPersistence::new());
        let runner = TaskRunner::new(store.clone(), 2);
        let calls = Arc::new(AtomicUsize::new(0));

        for (task_id, body_ok) in [("t1", true), ("t2", false)] {
            let task = TaskRecord {
                id: task_id.to_string(),
                process_id: 1,
                instance_id: None,
                name: "n".to_string(),
                description: "".to_string(),
                operation_type: "start".to_string(),
                status: "pending".to_string(),
                start_time: None,
                end_time: None,
                error_message: None,
                created_at: Utc::now(),
            };
            store.insert_task(&task).await.unwrap();

            let calls = calls.clone();
            runner.submit(
                task_id.to_string(),
                async move { Ok(body_ok) },
                Some(Box::new(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }

        // Give the pool time to drain both bodies.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.get_task("t1").await.unwrap().unwrap().status,
            "completed"
        );
        assert_eq!(store.get_task("t2").await.unwrap().unwrap().status, "failed");
    }

    #[tokio::test]
    async fn test_submit_contains_panic() {
        let store = Arc::new(MemoryPersistence::new());
        let runner = TaskRunner::new(store.clone(), 2);
        let task_id = seeded_task(&store).await;

        let explode = true;
        runner.submit(
            task_id.clone(),
            async move {
                if explode {
                    panic!("boom");
                }
                Ok(true)
            },
            None,
        );

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let task = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, "failed");
        assert!(task.error_message.unwrap().contains("panicked"));
    }
}
