use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coordinator_core::{
    models::{DecisionProgress, ProgressDelta, Task, TaskSpec, TaskState},
    traits::TaskRepository,
    CoordinatorError, CoordinatorResult,
};
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;
use crate::database::sqlite::sqlite_progress_repository::apply_delta_with;

const TASK_COLUMNS: &str = "id, decision_id, queue, priority, cpu_cores, memory_mb, \
    cpu_time_seconds, wall_time_seconds, payload, state, scheduler_id, node_id, created_at, \
    claimed_at, finished_at, retry_count, last_error, output_digest, progress, cancel_requested";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn to_signed(value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    /// 条件写入任务的可变字段，返回是否命中
    async fn update_if_state<'e, E>(
        executor: E,
        task: &Task,
        expected: TaskState,
    ) -> CoordinatorResult<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let progress = task
            .progress
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET queue = $3, state = $4, scheduler_id = $5, node_id = $6, claimed_at = $7,
                finished_at = $8, retry_count = $9, last_error = $10, output_digest = $11,
                progress = $12, cancel_requested = $13
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(task.id)
        .bind(expected)
        .bind(&task.queue)
        .bind(task.state)
        .bind(&task.scheduler_id)
        .bind(&task.node_id)
        .bind(task.claimed_at.map(MappingHelpers::to_millis))
        .bind(task.finished_at.map(MappingHelpers::to_millis))
        .bind(task.retry_count)
        .bind(&task.last_error)
        .bind(&task.output_digest)
        .bind(progress)
        .bind(task.cancel_requested)
        .execute(executor)
        .await
        .map_err(CoordinatorError::Database)?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn insert_tasks(
        &self,
        decision_id: i64,
        specs: &[TaskSpec],
    ) -> CoordinatorResult<Vec<Task>> {
        let now = MappingHelpers::to_millis(Utc::now());
        let mut tx = self.pool.begin().await.map_err(CoordinatorError::Database)?;
        let mut tasks = Vec::with_capacity(specs.len());

        for spec in specs {
            let queue = spec.queue.as_deref().ok_or_else(|| {
                CoordinatorError::InvalidArgument("任务必须指定队列".to_string())
            })?;
            let payload = serde_json::to_string(&spec.payload)
                .map_err(|e| CoordinatorError::Serialization(format!("序列化任务负载失败: {e}")))?;

            let row = sqlx::query(&format!(
                r#"
                INSERT INTO tasks (decision_id, queue, priority, cpu_cores, memory_mb,
                    cpu_time_seconds, wall_time_seconds, payload, state, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING {TASK_COLUMNS}
                "#
            ))
            .bind(decision_id)
            .bind(queue)
            .bind(spec.priority)
            .bind(spec.resources.cpu_cores as i64)
            .bind(Self::to_signed(spec.resources.memory_mb))
            .bind(spec.resources.cpu_time_seconds.map(Self::to_signed))
            .bind(spec.resources.wall_time_seconds.map(Self::to_signed))
            .bind(payload)
            .bind(TaskState::Pending)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(CoordinatorError::Database)?;
            let task = MappingHelpers::row_to_task(&row)?;

            for (position, digest) in spec.payload.input_digests.iter().enumerate() {
                sqlx::query("INSERT INTO task_inputs (task_id, position, digest) VALUES ($1, $2, $3)")
                    .bind(task.id)
                    .bind(position as i64)
                    .bind(digest)
                    .execute(&mut *tx)
                    .await
                    .map_err(CoordinatorError::Database)?;
            }

            tasks.push(task);
        }

        apply_delta_with(&mut *tx, decision_id, &ProgressDelta::created(tasks.len() as i64))
            .await?;
        tx.commit().await.map_err(CoordinatorError::Database)?;
        debug!("决策 {} 新建任务 {} 个", decision_id, tasks.len());
        Ok(tasks)
    }

    async fn get_task(&self, id: i64) -> CoordinatorResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;

        row.as_ref().map(MappingHelpers::row_to_task).transpose()
    }

    async fn list_by_decision(&self, decision_id: i64) -> CoordinatorResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE decision_id = $1 ORDER BY id"
        ))
        .bind(decision_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        rows.iter().map(MappingHelpers::row_to_task).collect()
    }

    async fn list_non_terminal(&self, decision_id: i64) -> CoordinatorResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE decision_id = $1 AND state IN ($2, $3) ORDER BY id"
        ))
        .bind(decision_id)
        .bind(TaskState::Pending)
        .bind(TaskState::Processing)
        .fetch_all(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        rows.iter().map(MappingHelpers::row_to_task).collect()
    }

    async fn compare_and_update(
        &self,
        task: &Task,
        expected: TaskState,
    ) -> CoordinatorResult<bool> {
        Self::update_if_state(&self.pool, task, expected).await
    }

    async fn transition(
        &self,
        task: &Task,
        expected: TaskState,
        delta: &ProgressDelta,
    ) -> CoordinatorResult<Option<DecisionProgress>> {
        let mut tx = self.pool.begin().await.map_err(CoordinatorError::Database)?;
        if !Self::update_if_state(&mut *tx, task, expected).await? {
            return Ok(None);
        }
        let progress = apply_delta_with(&mut *tx, task.decision_id, delta).await?;
        tx.commit().await.map_err(CoordinatorError::Database)?;
        Ok(Some(progress))
    }

    async fn find_stuck(&self, claimed_before: DateTime<Utc>) -> CoordinatorResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE state = $1 AND claimed_at < $2 ORDER BY claimed_at"
        ))
        .bind(TaskState::Processing)
        .bind(MappingHelpers::to_millis(claimed_before))
        .fetch_all(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        rows.iter().map(MappingHelpers::row_to_task).collect()
    }

    async fn find_pending(&self, created_before: DateTime<Utc>) -> CoordinatorResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE state = $1 AND created_at < $2 ORDER BY id"
        ))
        .bind(TaskState::Pending)
        .bind(MappingHelpers::to_millis(created_before))
        .fetch_all(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        rows.iter().map(MappingHelpers::row_to_task).collect()
    }

    async fn update_progress_info(
        &self,
        id: i64,
        info: &serde_json::Value,
    ) -> CoordinatorResult<()> {
        let result = sqlx::query("UPDATE tasks SET progress = $2 WHERE id = $1")
            .bind(id)
            .bind(serde_json::to_string(info)?)
            .execute(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::TaskNotFound { id });
        }
        Ok(())
    }

    async fn list_input_digests(&self, decision_id: i64) -> CoordinatorResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT ti.digest FROM task_inputs ti
            JOIN tasks t ON t.id = ti.task_id
            WHERE t.decision_id = $1
            ORDER BY ti.task_id, ti.position
            "#,
        )
        .bind(decision_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("digest").map_err(CoordinatorError::Database))
            .collect()
    }
}
