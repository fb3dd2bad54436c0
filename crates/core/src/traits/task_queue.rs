use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{NodeCapabilities, ResourceRequest};
use crate::CoordinatorResult;

/// 队列中的一个条目
///
/// `sequence` 是入队时分配的单调序号，用于同优先级下的先进先出。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub task_id: i64,
    pub queue: String,
    pub priority: i32,
    pub capability_class: String,
    pub resources: ResourceRequest,
    pub sequence: i64,
    pub enqueued_at: DateTime<Utc>,
}

/// 任务队列抽象接口
///
/// 拉取语义：`claim` 返回的条目对其他领取者不再可见。
/// 领取后未确认的任务由生命周期管理器负责重新入队，队列本身不做可见性超时。
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// 将任务加入指定队列
    async fn enqueue(
        &self,
        queue: &str,
        task_id: i64,
        priority: i32,
        resources: &ResourceRequest,
    ) -> CoordinatorResult<QueueEntry>;

    /// 领取一个能放入给定剩余容量的任务
    ///
    /// 满足条件的任务中优先级高者先出，同优先级按入队顺序。
    async fn claim(
        &self,
        queue: &str,
        capabilities: &NodeCapabilities,
    ) -> CoordinatorResult<Option<QueueEntry>>;

    /// 把刚领取的条目放回原位置（保留原序号）
    async fn restore(&self, entry: &QueueEntry) -> CoordinatorResult<()>;

    /// 从队列中移除任务，返回是否确实移除
    async fn remove(&self, queue: &str, task_id: i64) -> CoordinatorResult<bool>;

    /// 任务当前是否在队列中
    async fn contains(&self, queue: &str, task_id: i64) -> CoordinatorResult<bool>;

    /// 获取队列中的任务数量
    async fn queue_size(&self, queue: &str) -> CoordinatorResult<u64>;

    /// 列出当前非空的队列
    async fn list_queues(&self) -> CoordinatorResult<Vec<String>>;
}
