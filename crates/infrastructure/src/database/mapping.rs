//! Shared row mapping utilities for the SQLite repositories
//!
//! Timestamps are stored as unix milliseconds and unsigned quantities as
//! INTEGER, so every repository converts through these helpers.

use chrono::{DateTime, Utc};
use coordinator_core::{
    models::{
        BlobInfo, Decision, DecisionProgress, Job, NodeCapacity, NodeInfo, ResourceRequest,
        SchedulerInfo, Task, TaskPayload, Workload,
    },
    CoordinatorError, CoordinatorResult,
};
use sqlx::{sqlite::SqliteRow, Row};

/// Helper functions for converting between domain values and SQLite columns
pub struct MappingHelpers;

impl MappingHelpers {
    pub fn to_millis(value: DateTime<Utc>) -> i64 {
        value.timestamp_millis()
    }

    pub fn from_millis(millis: i64) -> CoordinatorResult<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| CoordinatorError::Serialization(format!("无效的时间戳: {millis}")))
    }

    pub fn timestamp(row: &SqliteRow, field_name: &str) -> CoordinatorResult<DateTime<Utc>> {
        Self::from_millis(row.try_get::<i64, _>(field_name)?)
    }

    pub fn optional_timestamp(
        row: &SqliteRow,
        field_name: &str,
    ) -> CoordinatorResult<Option<DateTime<Utc>>> {
        row.try_get::<Option<i64>, _>(field_name)?
            .map(Self::from_millis)
            .transpose()
    }

    /// 非负整数列；负值视为损坏数据
    pub fn unsigned(row: &SqliteRow, field_name: &str) -> CoordinatorResult<u64> {
        let value: i64 = row.try_get(field_name)?;
        u64::try_from(value).map_err(|_| {
            CoordinatorError::InvariantViolation(format!("列 {field_name} 出现负值: {value}"))
        })
    }

    pub fn unsigned32(row: &SqliteRow, field_name: &str) -> CoordinatorResult<u32> {
        let value = Self::unsigned(row, field_name)?;
        u32::try_from(value).map_err(|_| {
            CoordinatorError::InvariantViolation(format!("列 {field_name} 超出范围: {value}"))
        })
    }

    pub fn optional_unsigned(row: &SqliteRow, field_name: &str) -> CoordinatorResult<Option<u64>> {
        Ok(row
            .try_get::<Option<i64>, _>(field_name)?
            .map(|v| v.max(0) as u64))
    }

    pub fn json_text(row: &SqliteRow, field_name: &str) -> CoordinatorResult<serde_json::Value> {
        let text: String = row.try_get(field_name)?;
        serde_json::from_str(&text)
            .map_err(|e| CoordinatorError::Serialization(format!("解析JSON字段 {field_name} 失败: {e}")))
    }

    pub fn optional_json_text(
        row: &SqliteRow,
        field_name: &str,
    ) -> CoordinatorResult<Option<serde_json::Value>> {
        match row.try_get::<Option<String>, _>(field_name)? {
            Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
                CoordinatorError::Serialization(format!("解析JSON字段 {field_name} 失败: {e}"))
            }),
            None => Ok(None),
        }
    }

    pub fn row_to_job(row: &SqliteRow) -> CoordinatorResult<Job> {
        Ok(Job {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            parent_id: row.try_get("parent_id")?,
            status: row.try_get("status")?,
            created_at: Self::timestamp(row, "created_at")?,
            updated_at: Self::timestamp(row, "updated_at")?,
        })
    }

    pub fn row_to_decision(row: &SqliteRow) -> CoordinatorResult<Decision> {
        Ok(Decision {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            configuration_digest: row.try_get("configuration_digest")?,
            status: row.try_get("status")?,
            sealed: row.try_get("sealed")?,
            started_at: Self::timestamp(row, "started_at")?,
            finished_at: Self::optional_timestamp(row, "finished_at")?,
        })
    }

    pub fn row_to_task(row: &SqliteRow) -> CoordinatorResult<Task> {
        let payload: TaskPayload = serde_json::from_value(Self::json_text(row, "payload")?)?;

        Ok(Task {
            id: row.try_get("id")?,
            decision_id: row.try_get("decision_id")?,
            queue: row.try_get("queue")?,
            priority: row.try_get("priority")?,
            resources: ResourceRequest {
                cpu_cores: Self::unsigned32(row, "cpu_cores")?,
                memory_mb: Self::unsigned(row, "memory_mb")?,
                cpu_time_seconds: Self::optional_unsigned(row, "cpu_time_seconds")?,
                wall_time_seconds: Self::optional_unsigned(row, "wall_time_seconds")?,
            },
            payload,
            state: row.try_get("state")?,
            scheduler_id: row.try_get("scheduler_id")?,
            node_id: row.try_get("node_id")?,
            created_at: Self::timestamp(row, "created_at")?,
            claimed_at: Self::optional_timestamp(row, "claimed_at")?,
            finished_at: Self::optional_timestamp(row, "finished_at")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            output_digest: row.try_get("output_digest")?,
            progress: Self::optional_json_text(row, "progress")?,
            cancel_requested: row.try_get("cancel_requested")?,
        })
    }

    pub fn row_to_progress(row: &SqliteRow) -> CoordinatorResult<DecisionProgress> {
        Ok(DecisionProgress {
            decision_id: row.try_get("decision_id")?,
            total: row.try_get("total")?,
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            finished: row.try_get("finished")?,
            error: row.try_get("error")?,
            cancelled: row.try_get("cancelled")?,
            retried: row.try_get("retried")?,
            cpu_time_seconds: row.try_get("cpu_time_seconds")?,
            wall_time_seconds: row.try_get("wall_time_seconds")?,
            memory_mb_peak: Self::unsigned(row, "memory_mb_peak")?,
            finished_duration_ms: row.try_get("finished_duration_ms")?,
            updated_at: Self::optional_timestamp(row, "updated_at")?,
        })
    }

    /// 调度器行，节点列表由调用方补充
    pub fn row_to_scheduler(row: &SqliteRow) -> CoordinatorResult<SchedulerInfo> {
        Ok(SchedulerInfo {
            id: row.try_get("id")?,
            scheduler_type: row.try_get("scheduler_type")?,
            status: row.try_get("status")?,
            last_heartbeat: Self::timestamp(row, "last_heartbeat")?,
            registered_at: Self::timestamp(row, "registered_at")?,
            node_ids: Vec::new(),
        })
    }

    pub fn row_to_node(row: &SqliteRow) -> CoordinatorResult<NodeInfo> {
        Ok(NodeInfo {
            id: row.try_get("id")?,
            scheduler_id: row.try_get("scheduler_id")?,
            capacity: NodeCapacity {
                cpu_cores: Self::unsigned32(row, "capacity_cpu_cores")?,
                memory_mb: Self::unsigned(row, "capacity_memory_mb")?,
            },
            workload: Workload {
                cpu_cores: Self::unsigned32(row, "used_cpu_cores")?,
                memory_mb: Self::unsigned(row, "used_memory_mb")?,
                running_tasks: Self::unsigned32(row, "running_tasks")?,
            },
            reserved: Workload {
                cpu_cores: Self::unsigned32(row, "reserved_cpu_cores")?,
                memory_mb: Self::unsigned(row, "reserved_memory_mb")?,
                running_tasks: Self::unsigned32(row, "reserved_tasks")?,
            },
            status: row.try_get("status")?,
            updated_at: Self::timestamp(row, "updated_at")?,
        })
    }

    pub fn row_to_blob(row: &SqliteRow) -> CoordinatorResult<BlobInfo> {
        Ok(BlobInfo {
            digest: row.try_get("digest")?,
            size: Self::unsigned(row, "size")?,
            location: row.try_get("location")?,
            ref_count: row.try_get("ref_count")?,
            created_at: Self::timestamp(row, "created_at")?,
        })
    }
}
