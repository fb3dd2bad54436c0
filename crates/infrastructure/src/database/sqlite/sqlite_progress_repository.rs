use async_trait::async_trait;
use chrono::Utc;
use coordinator_core::{
    models::{DecisionProgress, ProgressDelta},
    traits::ProgressRepository,
    CoordinatorError, CoordinatorResult,
};
use sqlx::{Executor, Sqlite, SqlitePool};

use crate::database::mapping::MappingHelpers;

const PROGRESS_COLUMNS: &str = "decision_id, total, pending, processing, finished, error, \
    cancelled, retried, cpu_time_seconds, wall_time_seconds, memory_mb_peak, \
    finished_duration_ms, updated_at";

/// 决策进度计数器仓储
///
/// 每次增量是一条 `UPDATE ... RETURNING`，不会扫描任务表。
pub struct SqliteProgressRepository {
    pool: SqlitePool,
}

impl SqliteProgressRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressRepository for SqliteProgressRepository {
    async fn get_progress(&self, decision_id: i64) -> CoordinatorResult<Option<DecisionProgress>> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM decision_progress WHERE decision_id = $1"
        ))
        .bind(decision_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        row.as_ref().map(MappingHelpers::row_to_progress).transpose()
    }

    async fn apply_delta(
        &self,
        decision_id: i64,
        delta: &ProgressDelta,
    ) -> CoordinatorResult<DecisionProgress> {
        apply_delta_with(&self.pool, decision_id, delta).await
    }
}

/// 在给定连接或事务上应用一次增量
///
/// 任务状态转换与计数器更新需要在同一事务中完成时由任务仓储调用。
pub(crate) async fn apply_delta_with<'e, E>(
    executor: E,
    decision_id: i64,
    delta: &ProgressDelta,
) -> CoordinatorResult<DecisionProgress>
where
    E: Executor<'e, Database = Sqlite>,
{
    // 在零值上应用增量，得到每一列需要加上的数值
    let mut change = DecisionProgress::new(decision_id);
    change.apply(delta);

    let row = sqlx::query(&format!(
        r#"
        UPDATE decision_progress SET
            total = total + $2,
            pending = pending + $3,
            processing = processing + $4,
            finished = finished + $5,
            error = error + $6,
            cancelled = cancelled + $7,
            retried = retried + $8,
            cpu_time_seconds = cpu_time_seconds + $9,
            wall_time_seconds = wall_time_seconds + $10,
            memory_mb_peak = MAX(memory_mb_peak, $11),
            finished_duration_ms = finished_duration_ms + $12,
            updated_at = $13
        WHERE decision_id = $1
        RETURNING {PROGRESS_COLUMNS}
        "#
    ))
    .bind(decision_id)
    .bind(change.total)
    .bind(change.pending)
    .bind(change.processing)
    .bind(change.finished)
    .bind(change.error)
    .bind(change.cancelled)
    .bind(change.retried)
    .bind(change.cpu_time_seconds)
    .bind(change.wall_time_seconds)
    .bind(i64::try_from(change.memory_mb_peak).unwrap_or(i64::MAX))
    .bind(change.finished_duration_ms)
    .bind(MappingHelpers::to_millis(Utc::now()))
    .fetch_optional(executor)
    .await
    .map_err(CoordinatorError::Database)?;

    match row {
        Some(row) => MappingHelpers::row_to_progress(&row),
        None => Err(CoordinatorError::DecisionNotFound { id: decision_id }),
    }
}
