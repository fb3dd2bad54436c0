use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coordinator_core::{
    models::{NodeInfo, NodeSnapshot, NodeStatus, ResourceRequest, SchedulerInfo, SchedulerStatus},
    traits::RegistryRepository,
    CoordinatorError, CoordinatorResult,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::database::mapping::MappingHelpers;

const SCHEDULER_COLUMNS: &str = "id, scheduler_type, status, last_heartbeat, registered_at";
const NODE_COLUMNS: &str = "id, scheduler_id, capacity_cpu_cores, capacity_memory_mb, \
    used_cpu_cores, used_memory_mb, running_tasks, reserved_cpu_cores, reserved_memory_mb, \
    reserved_tasks, status, updated_at";

/// 调度器与节点注册表仓储
///
/// 心跳只写上报负载（`used_*`），预留与释放只写 `reserved_*`。
/// 预留是单条条件 UPDATE，按 `MAX(上报, 预留) + 需求 <= 容量` 检查，
/// 容量检查与写入在同一语句内完成。
pub struct SqliteRegistryRepository {
    pool: SqlitePool,
}

impl SqliteRegistryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn to_signed(value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    async fn node_ids(&self, scheduler_id: &str) -> CoordinatorResult<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM nodes WHERE scheduler_id = $1 ORDER BY id")
            .bind(scheduler_id)
            .fetch_all(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(CoordinatorError::Database))
            .collect()
    }

    async fn with_nodes(&self, mut scheduler: SchedulerInfo) -> CoordinatorResult<SchedulerInfo> {
        scheduler.node_ids = self.node_ids(&scheduler.id).await?;
        Ok(scheduler)
    }
}

#[async_trait]
impl RegistryRepository for SqliteRegistryRepository {
    async fn upsert_scheduler(
        &self,
        id: &str,
        scheduler_type: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<SchedulerInfo> {
        let now = MappingHelpers::to_millis(now);
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO schedulers (id, scheduler_type, status, last_heartbeat, registered_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT(id) DO UPDATE SET
                scheduler_type = excluded.scheduler_type,
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat
            RETURNING {SCHEDULER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(scheduler_type)
        .bind(SchedulerStatus::Connected)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        debug!("注册调度器成功: {} ({})", id, scheduler_type);
        self.with_nodes(MappingHelpers::row_to_scheduler(&row)?).await
    }

    async fn get_scheduler(&self, id: &str) -> CoordinatorResult<Option<SchedulerInfo>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULER_COLUMNS} FROM schedulers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        match row {
            Some(row) => Ok(Some(
                self.with_nodes(MappingHelpers::row_to_scheduler(&row)?).await?,
            )),
            None => Ok(None),
        }
    }

    async fn list_schedulers(&self) -> CoordinatorResult<Vec<SchedulerInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULER_COLUMNS} FROM schedulers ORDER BY registered_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        let mut schedulers = Vec::with_capacity(rows.len());
        for row in rows {
            let scheduler = MappingHelpers::row_to_scheduler(&row)?;
            schedulers.push(self.with_nodes(scheduler).await?);
        }
        Ok(schedulers)
    }

    async fn touch_heartbeat(&self, id: &str, now: DateTime<Utc>) -> CoordinatorResult<bool> {
        let result =
            sqlx::query("UPDATE schedulers SET last_heartbeat = $2, status = $3 WHERE id = $1")
                .bind(id)
                .bind(MappingHelpers::to_millis(now))
                .bind(SchedulerStatus::Connected)
                .execute(&self.pool)
                .await
                .map_err(CoordinatorError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_scheduler_status(
        &self,
        id: &str,
        status: SchedulerStatus,
    ) -> CoordinatorResult<()> {
        let result = sqlx::query("UPDATE schedulers SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::SchedulerNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn find_expired_schedulers(
        &self,
        before: DateTime<Utc>,
    ) -> CoordinatorResult<Vec<SchedulerInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULER_COLUMNS} FROM schedulers WHERE status = $1 AND last_heartbeat < $2"
        ))
        .bind(SchedulerStatus::Connected)
        .bind(MappingHelpers::to_millis(before))
        .fetch_all(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        let mut schedulers = Vec::with_capacity(rows.len());
        for row in rows {
            let scheduler = MappingHelpers::row_to_scheduler(&row)?;
            schedulers.push(self.with_nodes(scheduler).await?);
        }
        Ok(schedulers)
    }

    async fn replace_nodes(
        &self,
        scheduler_id: &str,
        nodes: &[NodeSnapshot],
        now: DateTime<Utc>,
    ) -> CoordinatorResult<Vec<NodeInfo>> {
        let now = MappingHelpers::to_millis(now);
        let mut tx = self.pool.begin().await.map_err(CoordinatorError::Database)?;

        let existing = sqlx::query("SELECT id FROM nodes WHERE scheduler_id = $1")
            .bind(scheduler_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(CoordinatorError::Database)?;

        for row in existing {
            let id: String = row.try_get("id")?;
            if !nodes.iter().any(|n| n.id == id) {
                sqlx::query("DELETE FROM nodes WHERE id = $1")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await
                    .map_err(CoordinatorError::Database)?;
                debug!("调度器 {} 不再上报节点 {}，已移除", scheduler_id, id);
            }
        }

        for node in nodes {
            let status = if node.healthy {
                NodeStatus::Healthy
            } else {
                NodeStatus::Unhealthy
            };
            sqlx::query(
                r#"
                INSERT INTO nodes (id, scheduler_id, capacity_cpu_cores, capacity_memory_mb,
                    used_cpu_cores, used_memory_mb, running_tasks, status, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT(id) DO UPDATE SET
                    scheduler_id = excluded.scheduler_id,
                    capacity_cpu_cores = excluded.capacity_cpu_cores,
                    capacity_memory_mb = excluded.capacity_memory_mb,
                    used_cpu_cores = excluded.used_cpu_cores,
                    used_memory_mb = excluded.used_memory_mb,
                    running_tasks = excluded.running_tasks,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&node.id)
            .bind(scheduler_id)
            .bind(node.capacity.cpu_cores as i64)
            .bind(Self::to_signed(node.capacity.memory_mb))
            .bind(node.workload.cpu_cores as i64)
            .bind(Self::to_signed(node.workload.memory_mb))
            .bind(node.workload.running_tasks as i64)
            .bind(status)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(CoordinatorError::Database)?;
        }

        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE scheduler_id = $1 ORDER BY id"
        ))
        .bind(scheduler_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(CoordinatorError::Database)?;
        let result = rows
            .iter()
            .map(MappingHelpers::row_to_node)
            .collect::<CoordinatorResult<Vec<_>>>()?;

        tx.commit().await.map_err(CoordinatorError::Database)?;
        Ok(result)
    }

    async fn get_node(&self, id: &str) -> CoordinatorResult<Option<NodeInfo>> {
        let row = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;

        row.as_ref().map(MappingHelpers::row_to_node).transpose()
    }

    async fn list_nodes(&self, scheduler_id: &str) -> CoordinatorResult<Vec<NodeInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE scheduler_id = $1 ORDER BY id"
        ))
        .bind(scheduler_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        rows.iter().map(MappingHelpers::row_to_node).collect()
    }

    async fn try_reserve(
        &self,
        node_id: &str,
        request: &ResourceRequest,
    ) -> CoordinatorResult<bool> {
        let cores = request.cpu_cores as i64;
        let memory = Self::to_signed(request.memory_mb);
        let result = sqlx::query(
            r#"
            UPDATE nodes SET
                reserved_cpu_cores = reserved_cpu_cores + $2,
                reserved_memory_mb = reserved_memory_mb + $3,
                reserved_tasks = reserved_tasks + 1,
                updated_at = $5
            WHERE id = $1
              AND status = $4
              AND MAX(used_cpu_cores, reserved_cpu_cores) + $2 <= capacity_cpu_cores
              AND MAX(used_memory_mb, reserved_memory_mb) + $3 <= capacity_memory_mb
            "#,
        )
        .bind(node_id)
        .bind(cores)
        .bind(memory)
        .bind(NodeStatus::Healthy)
        .bind(MappingHelpers::to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, node_id: &str, request: &ResourceRequest) -> CoordinatorResult<()> {
        let cores = request.cpu_cores as i64;
        let memory = Self::to_signed(request.memory_mb);
        let now = MappingHelpers::to_millis(Utc::now());

        let exact = sqlx::query(
            r#"
            UPDATE nodes SET
                reserved_cpu_cores = reserved_cpu_cores - $2,
                reserved_memory_mb = reserved_memory_mb - $3,
                reserved_tasks = reserved_tasks - 1,
                updated_at = $4
            WHERE id = $1
              AND reserved_cpu_cores >= $2
              AND reserved_memory_mb >= $3
              AND reserved_tasks >= 1
            "#,
        )
        .bind(node_id)
        .bind(cores)
        .bind(memory)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        if exact.rows_affected() == 1 {
            return Ok(());
        }

        // 节点被移出快照后又重新上报时预留从零开始，此时按零截断
        let saturated = sqlx::query(
            r#"
            UPDATE nodes SET
                reserved_cpu_cores = MAX(reserved_cpu_cores - $2, 0),
                reserved_memory_mb = MAX(reserved_memory_mb - $3, 0),
                reserved_tasks = MAX(reserved_tasks - 1, 0),
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(node_id)
        .bind(cores)
        .bind(memory)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        if saturated.rows_affected() == 0 {
            debug!("释放资源时节点 {} 已不存在", node_id);
        } else {
            warn!(
                node_id,
                cpu_cores = request.cpu_cores,
                memory_mb = request.memory_mb,
                "释放的资源超过节点记录的预留，已截断为零"
            );
        }
        Ok(())
    }

    async fn set_nodes_status(
        &self,
        scheduler_id: &str,
        status: NodeStatus,
    ) -> CoordinatorResult<()> {
        sqlx::query("UPDATE nodes SET status = $2, updated_at = $3 WHERE scheduler_id = $1")
            .bind(scheduler_id)
            .bind(status)
            .bind(MappingHelpers::to_millis(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;
        Ok(())
    }
}
