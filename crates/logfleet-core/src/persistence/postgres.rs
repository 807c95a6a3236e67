// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::CoreError;

use super::{
    InstanceRecord, MachineRecord, NewInstance, NewMachine, NewProcess, Persistence,
    ProcessRecord, StepRecord, TaskRecord,
};

/// PostgreSQL-backed persistence provider.
///
/// The `(machine_id, deploy_path)` uniqueness invariant and the
/// `(task_id, instance_id, step_kind)` step identity are both backed by
/// unique indexes in the schema (see `migrations/postgresql`), so the
/// check-then-insert in the scaling path cannot race past the store.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence provider from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL and run all migrations.
    pub async fn connect(database_url: &str) -> Result<Self, CoreError> {
        let pool = PgPool::connect(database_url).await?;
        crate::migrations::run_postgres(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;
        Ok(Self::new(pool))
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_machine(&self, machine: &NewMachine) -> Result<i64, CoreError> {
        let id: i64 = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO machines (name, host, port, username)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&machine.name)
        .bind(&machine.host)
        .bind(machine.port)
        .bind(&machine.username)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_machine(&self, machine_id: i64) -> Result<Option<MachineRecord>, CoreError> {
        let record = sqlx::query_as::<_, MachineRecord>(
            r#"
            SELECT id, name, host, port, username
            FROM machines
            WHERE id = $1
            "#,
        )
        .bind(machine_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert_process(&self, process: &NewProcess) -> Result<i64, CoreError> {
        let id: i64 = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO processes (name, module, pipeline_config, jvm_options, deploy_base_dir, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING id
            "#,
        )
        .bind(&process.name)
        .bind(&process.module)
        .bind(&process.pipeline_config)
        .bind(&process.jvm_options)
        .bind(&process.deploy_base_dir)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_process(&self, process_id: i64) -> Result<Option<ProcessRecord>, CoreError> {
        let record = sqlx::query_as::<_, ProcessRecord>(
            r#"
            SELECT id, name, module, pipeline_config, jvm_options, deploy_base_dir, created_at
            FROM processes
            WHERE id = $1
            "#,
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_process_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ProcessRecord>, CoreError> {
        let record = sqlx::query_as::<_, ProcessRecord>(
            r#"
            SELECT id, name, module, pipeline_config, jvm_options, deploy_base_dir, created_at
            FROM processes
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert_instance(&self, instance: &NewInstance) -> Result<i64, CoreError> {
        let id: i64 = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO instances (process_id, machine_id, deploy_path, state, state_changed_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING id
            "#,
        )
        .bind(instance.process_id)
        .bind(instance.machine_id)
        .bind(&instance.deploy_path)
        .bind(&instance.state)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_instance(&self, instance_id: i64) -> Result<Option<InstanceRecord>, CoreError> {
        let record = sqlx::query_as::<_, InstanceRecord>(
            r#"
            SELECT id, process_id, machine_id, deploy_path, state, pid, state_changed_at
            FROM instances
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_instances_by_process(
        &self,
        process_id: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let records = sqlx::query_as::<_, InstanceRecord>(
            r#"
            SELECT id, process_id, machine_id, deploy_path, state, pid, state_changed_at
            FROM instances
            WHERE process_id = $1
            ORDER BY id
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_instance_by_machine_and_path(
        &self,
        machine_id: i64,
        deploy_path: &str,
    ) -> Result<Option<InstanceRecord>, CoreError> {
        let record = sqlx::query_as::<_, InstanceRecord>(
            r#"
            SELECT id, process_id, machine_id, deploy_path, state, pid, state_changed_at
            FROM instances
            WHERE machine_id = $1 AND deploy_path = $2
            "#,
        )
        .bind(machine_id)
        .bind(deploy_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_instances_with_pid(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        let records = sqlx::query_as::<_, InstanceRecord>(
            r#"
            SELECT id, process_id, machine_id, deploy_path, state, pid, state_changed_at
            FROM instances
            WHERE pid IS NOT NULL AND pid <> ''
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_instance_state(
        &self,
        instance_id: i64,
        state: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE instances
            SET state = $2, state_changed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_instance_pid(
        &self,
        instance_id: i64,
        pid: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE instances
            SET pid = $2
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(pid)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_instance_if_dead(
        &self,
        instance_id: i64,
        from_states: &[&str],
    ) -> Result<bool, CoreError> {
        let states: Vec<String> = from_states.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET state = 'not_started', pid = NULL, state_changed_at = NOW()
            WHERE id = $1 AND pid IS NOT NULL AND state = ANY($2)
            "#,
        )
        .bind(instance_id)
        .bind(&states)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_instance(&self, instance_id: i64) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM instances WHERE id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, process_id, instance_id, name, description,
                operation_type, status, start_time, end_time, error_message, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&task.id)
        .bind(task.process_id)
        .bind(task.instance_id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.operation_type)
        .bind(&task.status)
        .bind(task.start_time)
        .bind(task.end_time)
        .bind(&task.error_message)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT id, process_id, instance_id, name, description,
                   operation_type, status, start_time, end_time, error_message, created_at
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_tasks_by_process(
        &self,
        process_id: i64,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT id, process_id, instance_id, name, description,
                   operation_type, status, start_time, end_time, error_message, created_at
            FROM tasks
            WHERE process_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_tasks_by_instance(
        &self,
        instance_id: i64,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT id, process_id, instance_id, name, description,
                   operation_type, status, start_time, end_time, error_message, created_at
            FROM tasks
            WHERE instance_id = $1
               OR id IN (SELECT DISTINCT task_id FROM task_steps WHERE instance_id = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_task_status(&self, task_id: &str, status: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE tasks SET status = $2 WHERE id = $1")
            .bind(task_id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_task_started(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE tasks SET start_time = $2 WHERE id = $1 AND start_time IS NULL")
            .bind(task_id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_task_finished(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result =
            sqlx::query("UPDATE tasks SET end_time = $2 WHERE id = $1 AND end_time IS NULL")
                .bind(task_id)
                .bind(at)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_task_error(&self, task_id: &str, error: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE tasks SET error_message = $2 WHERE id = $1")
            .bind(task_id)
            .bind(error)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_steps(&self, steps: &[StepRecord]) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO task_steps (
                    task_id, instance_id, machine_id, step_kind, step_name,
                    status, start_time, end_time, error_message
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(&step.task_id)
            .bind(step.instance_id)
            .bind(step.machine_id)
            .bind(&step.step_kind)
            .bind(&step.step_name)
            .bind(&step.status)
            .bind(step.start_time)
            .bind(step.end_time)
            .bind(&step.error_message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn list_steps_by_task(&self, task_id: &str) -> Result<Vec<StepRecord>, CoreError> {
        let records = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT task_id, instance_id, machine_id, step_kind, step_name,
                   status, start_time, end_time, error_message
            FROM task_steps
            WHERE task_id = $1
            ORDER BY seq
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_step_status(
        &self,
        task_id: &str,
        instance_id: i64,
        step_kind: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE task_steps
            SET status = $4, error_message = COALESCE($5, error_message)
            WHERE task_id = $1 AND instance_id = $2 AND step_kind = $3
            "#,
        )
        .bind(task_id)
        .bind(instance_id)
        .bind(step_kind)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_step_started(
        &self,
        task_id: &str,
        instance_id: i64,
        step_kind: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE task_steps
            SET start_time = $4
            WHERE task_id = $1 AND instance_id = $2 AND step_kind = $3 AND start_time IS NULL
            "#,
        )
        .bind(task_id)
        .bind(instance_id)
        .bind(step_kind)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_step_finished(
        &self,
        task_id: &str,
        instance_id: i64,
        step_kind: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE task_steps
            SET end_time = $4
            WHERE task_id = $1 AND instance_id = $2 AND step_kind = $3 AND end_time IS NULL
            "#,
        )
        .bind(task_id)
        .bind(instance_id)
        .bind(step_kind)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
