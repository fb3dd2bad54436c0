use async_trait::async_trait;
use chrono::Utc;
use coordinator_core::{
    models::{Decision, DecisionStatus, Job, JobStatus},
    traits::{DecisionRepository, JobRepository},
    CoordinatorError, CoordinatorResult,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

const DECISION_COLUMNS: &str =
    "id, job_id, configuration_digest, status, sealed, started_at, finished_at";

/// 作业与决策的 SQLite 仓储
pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn create_job(&self, name: &str, parent_id: Option<i64>) -> CoordinatorResult<Job> {
        let now = MappingHelpers::to_millis(Utc::now());
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (name, parent_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING id, name, parent_id, status, created_at, updated_at
            "#,
        )
        .bind(name)
        .bind(parent_id)
        .bind(JobStatus::NotStarted)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        let job = MappingHelpers::row_to_job(&row)?;
        debug!("创建作业成功: {} ({})", job.id, job.name);
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> CoordinatorResult<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, name, parent_id, status, created_at, updated_at FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        row.as_ref().map(MappingHelpers::row_to_job).transpose()
    }

    async fn update_job_status(&self, id: i64, status: JobStatus) -> CoordinatorResult<()> {
        let result = sqlx::query("UPDATE jobs SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(MappingHelpers::to_millis(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::JobNotFound { id });
        }
        Ok(())
    }
}

#[async_trait]
impl DecisionRepository for SqliteJobRepository {
    async fn create_decision(
        &self,
        job_id: i64,
        configuration_digest: Option<&str>,
    ) -> CoordinatorResult<Decision> {
        let now = MappingHelpers::to_millis(Utc::now());
        let mut tx = self.pool.begin().await.map_err(CoordinatorError::Database)?;

        let job = sqlx::query("SELECT id FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(CoordinatorError::Database)?;
        if job.is_none() {
            return Err(CoordinatorError::JobNotFound { id: job_id });
        }

        let active = sqlx::query(
            "SELECT id FROM decisions WHERE job_id = $1 AND status IN ($2, $3) LIMIT 1",
        )
        .bind(job_id)
        .bind(DecisionStatus::Running)
        .bind(DecisionStatus::Cancelling)
        .fetch_optional(&mut *tx)
        .await
        .map_err(CoordinatorError::Database)?;
        if let Some(row) = active {
            return Err(CoordinatorError::JobAlreadyRunning {
                job_id,
                decision_id: row.try_get("id")?,
            });
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO decisions (job_id, configuration_digest, status, sealed, started_at)
            VALUES ($1, $2, $3, 0, $4)
            RETURNING {DECISION_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(configuration_digest)
        .bind(DecisionStatus::Running)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(CoordinatorError::Database)?;
        let decision = MappingHelpers::row_to_decision(&row)?;

        sqlx::query("UPDATE jobs SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(job_id)
            .bind(JobStatus::Running)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(CoordinatorError::Database)?;

        sqlx::query("INSERT INTO decision_progress (decision_id, updated_at) VALUES ($1, $2)")
            .bind(decision.id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(CoordinatorError::Database)?;

        tx.commit().await.map_err(CoordinatorError::Database)?;

        debug!("创建决策成功: {} (作业 {})", decision.id, job_id);
        Ok(decision)
    }

    async fn get_decision(&self, id: i64) -> CoordinatorResult<Option<Decision>> {
        let row = sqlx::query(&format!(
            "SELECT {DECISION_COLUMNS} FROM decisions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        row.as_ref().map(MappingHelpers::row_to_decision).transpose()
    }

    async fn active_decision_for_job(&self, job_id: i64) -> CoordinatorResult<Option<Decision>> {
        let row = sqlx::query(&format!(
            "SELECT {DECISION_COLUMNS} FROM decisions WHERE job_id = $1 AND status IN ($2, $3) ORDER BY id DESC LIMIT 1"
        ))
        .bind(job_id)
        .bind(DecisionStatus::Running)
        .bind(DecisionStatus::Cancelling)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        row.as_ref().map(MappingHelpers::row_to_decision).transpose()
    }

    async fn update_decision_status(
        &self,
        id: i64,
        status: DecisionStatus,
    ) -> CoordinatorResult<()> {
        let finished_at = (!status.is_active()).then(|| MappingHelpers::to_millis(Utc::now()));
        let result = sqlx::query(
            "UPDATE decisions SET status = $2, finished_at = COALESCE($3, finished_at) WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(finished_at)
        .execute(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::DecisionNotFound { id });
        }
        debug!("更新决策状态: {} -> {}", id, status);
        Ok(())
    }

    async fn seal_decision(&self, id: i64) -> CoordinatorResult<()> {
        let result = sqlx::query("UPDATE decisions SET sealed = 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::DecisionNotFound { id });
        }
        Ok(())
    }

    async fn delete_decision(&self, id: i64) -> CoordinatorResult<()> {
        let mut tx = self.pool.begin().await.map_err(CoordinatorError::Database)?;

        sqlx::query(
            "DELETE FROM task_inputs WHERE task_id IN (SELECT id FROM tasks WHERE decision_id = $1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(CoordinatorError::Database)?;

        sqlx::query("DELETE FROM tasks WHERE decision_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(CoordinatorError::Database)?;

        sqlx::query("DELETE FROM decision_progress WHERE decision_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(CoordinatorError::Database)?;

        let result = sqlx::query("DELETE FROM decisions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(CoordinatorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::DecisionNotFound { id });
        }

        tx.commit().await.map_err(CoordinatorError::Database)?;
        debug!("删除决策成功: {}", id);
        Ok(())
    }
}
