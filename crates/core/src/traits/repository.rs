//! 数据仓储层接口定义
//!
//! 此模块定义了持久化层的核心抽象接口：
//! - 作业与决策仓储 (`JobRepository`, `DecisionRepository`)
//! - 任务仓储 (`TaskRepository`)
//! - 决策进度计数器仓储 (`ProgressRepository`)
//! - 调度器/节点注册表仓储 (`RegistryRepository`)
//! - Blob 元数据仓储 (`BlobRepository`)
//!
//! ## 原子性约定
//!
//! 需要"读后写"的共享计数器（节点负载、Blob 引用计数、进度计数器）
//! 都以单条条件 UPDATE 的形式暴露，实现必须保证其原子性，
//! 调用方不需要先读再写。任务状态通过 `compare_and_update` 做乐观并发控制；
//! 改变状态的写入走 `transition`，状态与进度计数器在同一事务中提交。
//!
//! ## 错误处理
//!
//! 所有方法返回 `CoordinatorResult<T>`；存储错误原样向上传播，
//! 查询不到记录时返回 `Ok(None)` 而不是错误。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    BlobInfo, Decision, DecisionProgress, DecisionStatus, Job, JobStatus, NodeInfo, NodeSnapshot,
    NodeStatus, ProgressDelta, ResourceRequest, SchedulerInfo, SchedulerStatus, Task, TaskSpec,
    TaskState,
};
use crate::CoordinatorResult;

/// 作业仓储接口
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 创建作业，初始状态为 `NOT_STARTED`
    async fn create_job(&self, name: &str, parent_id: Option<i64>) -> CoordinatorResult<Job>;

    async fn get_job(&self, id: i64) -> CoordinatorResult<Option<Job>>;

    async fn update_job_status(&self, id: i64, status: JobStatus) -> CoordinatorResult<()>;
}

/// 决策仓储接口
#[async_trait]
pub trait DecisionRepository: Send + Sync {
    /// 创建决策
    ///
    /// 在同一事务中检查作业没有其他活动决策、把作业置为 `RUNNING`
    /// 并初始化进度计数器。已有活动决策时返回 `JobAlreadyRunning`。
    async fn create_decision(
        &self,
        job_id: i64,
        configuration_digest: Option<&str>,
    ) -> CoordinatorResult<Decision>;

    async fn get_decision(&self, id: i64) -> CoordinatorResult<Option<Decision>>;

    async fn active_decision_for_job(&self, job_id: i64) -> CoordinatorResult<Option<Decision>>;

    /// 更新决策状态；进入终态时记录结束时间
    async fn update_decision_status(
        &self,
        id: i64,
        status: DecisionStatus,
    ) -> CoordinatorResult<()>;

    async fn seal_decision(&self, id: i64) -> CoordinatorResult<()>;

    /// 删除决策及其任务、任务输入与进度计数器
    async fn delete_decision(&self, id: i64) -> CoordinatorResult<()>;
}

/// 任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 在一个事务中批量创建 `PENDING` 任务，并把新建数计入决策进度
    ///
    /// `specs` 的队列名必须已经确定；决策没有进度计数器时整个事务回滚。
    async fn insert_tasks(&self, decision_id: i64, specs: &[TaskSpec])
        -> CoordinatorResult<Vec<Task>>;

    async fn get_task(&self, id: i64) -> CoordinatorResult<Option<Task>>;

    async fn list_by_decision(&self, decision_id: i64) -> CoordinatorResult<Vec<Task>>;

    /// 决策中尚未到达终态的任务
    async fn list_non_terminal(&self, decision_id: i64) -> CoordinatorResult<Vec<Task>>;

    /// 乐观并发写入
    ///
    /// 仅当库中任务状态仍为 `expected` 时写入 `task` 的全部可变字段，
    /// 返回是否写入成功。只用于不改变状态的字段更新。
    async fn compare_and_update(&self, task: &Task, expected: TaskState)
        -> CoordinatorResult<bool>;

    /// 状态转换
    ///
    /// 与 `compare_and_update` 的条件相同，但任务写入与 `delta` 对决策进度的
    /// 更新在同一事务中提交。状态不匹配时什么都不写并返回 `None`。
    async fn transition(
        &self,
        task: &Task,
        expected: TaskState,
        delta: &ProgressDelta,
    ) -> CoordinatorResult<Option<DecisionProgress>>;

    /// 领取时间早于 `claimed_before` 的 `PROCESSING` 任务
    async fn find_stuck(&self, claimed_before: DateTime<Utc>) -> CoordinatorResult<Vec<Task>>;

    /// 创建时间早于 `created_before` 且仍为 `PENDING` 的任务
    async fn find_pending(&self, created_before: DateTime<Utc>) -> CoordinatorResult<Vec<Task>>;

    /// 更新仅用于展示的进度信息，不改变状态
    async fn update_progress_info(
        &self,
        id: i64,
        info: &serde_json::Value,
    ) -> CoordinatorResult<()>;

    /// 决策下所有任务引用的输入摘要（含重复）
    async fn list_input_digests(&self, decision_id: i64) -> CoordinatorResult<Vec<String>>;
}

/// 决策进度计数器仓储接口
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    async fn get_progress(&self, decision_id: i64) -> CoordinatorResult<Option<DecisionProgress>>;

    /// 原子地应用一次增量并返回更新后的计数器
    async fn apply_delta(
        &self,
        decision_id: i64,
        delta: &ProgressDelta,
    ) -> CoordinatorResult<DecisionProgress>;
}

/// 调度器/节点注册表仓储接口
#[async_trait]
pub trait RegistryRepository: Send + Sync {
    /// 注册或重新注册调度器，同时重置心跳
    async fn upsert_scheduler(
        &self,
        id: &str,
        scheduler_type: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<SchedulerInfo>;

    async fn get_scheduler(&self, id: &str) -> CoordinatorResult<Option<SchedulerInfo>>;

    async fn list_schedulers(&self) -> CoordinatorResult<Vec<SchedulerInfo>>;

    /// 刷新心跳并置为 `CONNECTED`，调度器不存在时返回 false
    async fn touch_heartbeat(&self, id: &str, now: DateTime<Utc>) -> CoordinatorResult<bool>;

    async fn set_scheduler_status(&self, id: &str, status: SchedulerStatus)
        -> CoordinatorResult<()>;

    /// 心跳早于 `before` 且仍为 `CONNECTED` 的调度器
    async fn find_expired_schedulers(
        &self,
        before: DateTime<Utc>,
    ) -> CoordinatorResult<Vec<SchedulerInfo>>;

    /// 在一个事务中替换调度器的节点集合与上报负载
    ///
    /// 快照中没有出现的节点被删除；已存在节点的预留保持不变。
    async fn replace_nodes(
        &self,
        scheduler_id: &str,
        nodes: &[NodeSnapshot],
        now: DateTime<Utc>,
    ) -> CoordinatorResult<Vec<NodeInfo>>;

    async fn get_node(&self, id: &str) -> CoordinatorResult<Option<NodeInfo>>;

    async fn list_nodes(&self, scheduler_id: &str) -> CoordinatorResult<Vec<NodeInfo>>;

    /// 仅当 `max(上报负载, 预留) + 需求` 不超过总容量时增加节点预留，返回是否预留成功
    async fn try_reserve(&self, node_id: &str, request: &ResourceRequest)
        -> CoordinatorResult<bool>;

    /// 减少节点预留，最低减到零
    async fn release(&self, node_id: &str, request: &ResourceRequest) -> CoordinatorResult<()>;

    async fn set_nodes_status(&self, scheduler_id: &str, status: NodeStatus)
        -> CoordinatorResult<()>;
}

/// Blob 元数据仓储接口
#[async_trait]
pub trait BlobRepository: Send + Sync {
    async fn get_blob(&self, digest: &str) -> CoordinatorResult<Option<BlobInfo>>;

    async fn insert_blob(&self, blob: &BlobInfo) -> CoordinatorResult<()>;

    /// 引用计数加一，返回新计数；Blob 不存在或计数已为零时返回 None
    ///
    /// 计数为零的行正在被删除，不能再被引用。
    async fn increment_ref(&self, digest: &str) -> CoordinatorResult<Option<i64>>;

    /// 引用计数减一，返回新计数；Blob 不存在或计数已为零时返回 None
    async fn decrement_ref(&self, digest: &str) -> CoordinatorResult<Option<i64>>;

    /// 仅当引用计数为零时删除元数据行，返回是否删除
    async fn delete_if_unreferenced(&self, digest: &str) -> CoordinatorResult<bool>;
}
