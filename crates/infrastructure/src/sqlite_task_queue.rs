use async_trait::async_trait;
use chrono::Utc;
use coordinator_core::{
    models::{NodeCapabilities, ResourceRequest},
    traits::{QueueEntry, TaskQueue},
    CoordinatorError, CoordinatorResult,
};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use crate::database::MappingHelpers;

const ENTRY_COLUMNS: &str = "seq, queue, task_id, priority, capability_class, cpu_cores, \
    memory_mb, cpu_time_seconds, wall_time_seconds, enqueued_at";

/// 持久化任务队列
///
/// 条目保存在 `task_queue` 表中，生产者和调度器各自重启都不会丢失未领取的任务。
/// 领取是一条 `DELETE ... RETURNING` 语句，选择与删除在同一语句中完成，
/// 并发领取者不会拿到同一个条目。
pub struct SqliteTaskQueue {
    pool: SqlitePool,
}

impl SqliteTaskQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn to_signed(value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    fn row_to_entry(row: &SqliteRow) -> CoordinatorResult<QueueEntry> {
        Ok(QueueEntry {
            task_id: row.try_get("task_id")?,
            queue: row.try_get("queue")?,
            priority: row.try_get("priority")?,
            capability_class: row.try_get("capability_class")?,
            resources: ResourceRequest {
                cpu_cores: MappingHelpers::unsigned32(row, "cpu_cores")?,
                memory_mb: MappingHelpers::unsigned(row, "memory_mb")?,
                cpu_time_seconds: MappingHelpers::optional_unsigned(row, "cpu_time_seconds")?,
                wall_time_seconds: MappingHelpers::optional_unsigned(row, "wall_time_seconds")?,
            },
            sequence: row.try_get("seq")?,
            enqueued_at: MappingHelpers::timestamp(row, "enqueued_at")?,
        })
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(
        &self,
        queue: &str,
        task_id: i64,
        priority: i32,
        resources: &ResourceRequest,
    ) -> CoordinatorResult<QueueEntry> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO task_queue (queue, task_id, priority, capability_class, cpu_cores,
                memory_mb, cpu_time_seconds, wall_time_seconds, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT(task_id) DO NOTHING
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(task_id)
        .bind(priority)
        .bind(resources.capability_class())
        .bind(resources.cpu_cores as i64)
        .bind(Self::to_signed(resources.memory_mb))
        .bind(resources.cpu_time_seconds.map(Self::to_signed))
        .bind(resources.wall_time_seconds.map(Self::to_signed))
        .bind(MappingHelpers::to_millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        match row {
            Some(row) => {
                debug!("任务 {} 进入队列 {}", task_id, queue);
                Self::row_to_entry(&row)
            }
            None => Err(CoordinatorError::TaskQueue(format!(
                "任务 {task_id} 已在队列中"
            ))),
        }
    }

    async fn claim(
        &self,
        queue: &str,
        capabilities: &NodeCapabilities,
    ) -> CoordinatorResult<Option<QueueEntry>> {
        let row = sqlx::query(&format!(
            r#"
            DELETE FROM task_queue
            WHERE seq = (
                SELECT seq FROM task_queue
                WHERE queue = $1 AND cpu_cores <= $2 AND memory_mb <= $3
                ORDER BY priority DESC, seq ASC
                LIMIT 1
            )
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(capabilities.cpu_cores as i64)
        .bind(Self::to_signed(capabilities.memory_mb))
        .fetch_optional(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn restore(&self, entry: &QueueEntry) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task_queue (seq, queue, task_id, priority, capability_class, cpu_cores,
                memory_mb, cpu_time_seconds, wall_time_seconds, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(entry.sequence)
        .bind(&entry.queue)
        .bind(entry.task_id)
        .bind(entry.priority)
        .bind(&entry.capability_class)
        .bind(entry.resources.cpu_cores as i64)
        .bind(Self::to_signed(entry.resources.memory_mb))
        .bind(entry.resources.cpu_time_seconds.map(Self::to_signed))
        .bind(entry.resources.wall_time_seconds.map(Self::to_signed))
        .bind(MappingHelpers::to_millis(entry.enqueued_at))
        .execute(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;
        Ok(())
    }

    async fn remove(&self, queue: &str, task_id: i64) -> CoordinatorResult<bool> {
        let result = sqlx::query("DELETE FROM task_queue WHERE queue = $1 AND task_id = $2")
            .bind(queue)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn contains(&self, queue: &str, task_id: i64) -> CoordinatorResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT seq FROM task_queue WHERE queue = $1 AND task_id = $2")
                .bind(queue)
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(CoordinatorError::Database)?;
        Ok(found.is_some())
    }

    async fn queue_size(&self, queue: &str) -> CoordinatorResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_queue WHERE queue = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;
        Ok(count.max(0) as u64)
    }

    async fn list_queues(&self) -> CoordinatorResult<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT queue FROM task_queue ORDER BY queue")
                .fetch_all(&self.pool)
                .await
                .map_err(CoordinatorError::Database)?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;

    async fn setup() -> SqliteTaskQueue {
        let db = DatabaseManager::in_memory().await.unwrap();
        SqliteTaskQueue::new(db.pool().clone())
    }

    fn caps(cpu_cores: u32, memory_mb: u64) -> NodeCapabilities {
        NodeCapabilities {
            cpu_cores,
            memory_mb,
        }
    }

    #[tokio::test]
    async fn test_claim_order_and_filter() {
        let queue = setup().await;
        queue
            .enqueue("default", 1, 0, &ResourceRequest::new(1, 512))
            .await
            .unwrap();
        queue
            .enqueue("default", 2, 9, &ResourceRequest::new(8, 512))
            .await
            .unwrap();
        queue
            .enqueue("default", 3, 1, &ResourceRequest::new(1, 512))
            .await
            .unwrap();

        let first = queue.claim("default", &caps(2, 4096)).await.unwrap().unwrap();
        assert_eq!(first.task_id, 3);
        let second = queue.claim("default", &caps(2, 4096)).await.unwrap().unwrap();
        assert_eq!(second.task_id, 1);
        assert!(queue.claim("default", &caps(2, 4096)).await.unwrap().is_none());

        let big = queue.claim("default", &caps(8, 4096)).await.unwrap().unwrap();
        assert_eq!(big.task_id, 2);
        assert_eq!(big.capability_class, "c8m1");
    }

    #[tokio::test]
    async fn test_restore_keeps_sequence() {
        let queue = setup().await;
        let request = ResourceRequest::new(1, 128);
        queue.enqueue("default", 1, 0, &request).await.unwrap();
        queue.enqueue("default", 2, 0, &request).await.unwrap();

        let first = queue.claim("default", &caps(1, 128)).await.unwrap().unwrap();
        queue.restore(&first).await.unwrap();
        // 重复放回不会产生第二个条目
        queue.restore(&first).await.unwrap();
        assert_eq!(queue.queue_size("default").await.unwrap(), 2);

        let again = queue.claim("default", &caps(1, 128)).await.unwrap().unwrap();
        assert_eq!(again.task_id, 1);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_rejected() {
        let queue = setup().await;
        let request = ResourceRequest::new(1, 128);
        queue.enqueue("default", 5, 0, &request).await.unwrap();
        let err = queue.enqueue("default", 5, 0, &request).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::TaskQueue(_)));
        assert!(queue.contains("default", 5).await.unwrap());
        assert!(!queue.contains("other", 5).await.unwrap());

        assert!(queue.remove("default", 5).await.unwrap());
        assert!(!queue.contains("default", 5).await.unwrap());
        assert_eq!(queue.list_queues().await.unwrap(), Vec::<String>::new());
    }
}
