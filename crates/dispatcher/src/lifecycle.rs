//! 任务生命周期管理
//!
//! 所有任务状态转换都在 `task:<id>` 锁内完成并以比较交换写回存储，
//! 同一任务上的并发上报最多只有一个生效。状态与决策进度计数器在同一事务中提交，
//! 提交之后才通知订阅者。锁顺序为 任务 → 节点 → 决策，
//! 持有决策锁时不会再获取任务锁。
//!
//! ```text
//! create_tasks ──> PENDING ──claim_next──> PROCESSING ──report_success──> FINISHED
//!                    ↑                         │  │
//!                    └──瞬时失败(未超过上限)───┘  ├──report_failure──> ERROR
//!                                                └──cancel + ack─────> CANCELLED
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use coordinator_core::{
    config::LifecycleConfig,
    models::{Decision, DecisionStatus, ProgressDelta, ResultPayload, Task, TaskFailure, TaskSpec, TaskState},
    traits::{BlobStore, DecisionRepository, JobRepository, QueueEntry, TaskQueue, TaskRepository},
    CoordinatorError, CoordinatorResult, LockGuard, LockKey, LockManager,
};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::progress::ProgressAggregator;
use crate::registry::SchedulerRegistry;

/// 生命周期管理器依赖的组件
pub struct LifecycleComponents {
    pub tasks: Arc<dyn TaskRepository>,
    pub decisions: Arc<dyn DecisionRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub queue: Arc<dyn TaskQueue>,
    pub registry: Arc<SchedulerRegistry>,
    pub blobs: Arc<dyn BlobStore>,
    pub progress: Arc<ProgressAggregator>,
    pub locks: LockManager,
}

/// 单个队列条目的领取结果
enum ClaimOutcome {
    Claimed(Task),
    /// 节点预留失败，条目需要放回队列
    Rejected,
    /// 条目对应的任务已不是 PENDING（已取消或已删除）
    Stale,
}

/// 成功上报的处理结果
enum SuccessOutcome {
    Finished(Task),
    Cancelled(Task),
    Duplicate(Task),
}

/// 任务生命周期管理器
pub struct TaskLifecycleManager {
    tasks: Arc<dyn TaskRepository>,
    decisions: Arc<dyn DecisionRepository>,
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<SchedulerRegistry>,
    blobs: Arc<dyn BlobStore>,
    progress: Arc<ProgressAggregator>,
    locks: LockManager,
    config: LifecycleConfig,
}

impl TaskLifecycleManager {
    pub fn new(components: LifecycleComponents, config: Option<LifecycleConfig>) -> Self {
        Self {
            tasks: components.tasks,
            decisions: components.decisions,
            jobs: components.jobs,
            queue: components.queue,
            registry: components.registry,
            blobs: components.blobs,
            progress: components.progress,
            locks: components.locks,
            config: config.unwrap_or_default(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn progress(&self) -> &Arc<ProgressAggregator> {
        &self.progress
    }

    /// 在决策下批量创建任务并入队
    ///
    /// 每个输入摘要各取得一次 Blob 引用；决策未运行或已封存时返回 `DecisionNotActive`。
    pub async fn create_tasks(
        &self,
        decision_id: i64,
        specs: Vec<TaskSpec>,
    ) -> CoordinatorResult<Vec<Task>> {
        let _guard = self
            .locks
            .acquire(&[LockKey::decision(decision_id)], "create-tasks")
            .await?;

        let decision = self.load_decision(decision_id).await?;
        if !decision.accepts_tasks() {
            return Err(CoordinatorError::DecisionNotActive { id: decision_id });
        }
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let specs = specs
            .into_iter()
            .map(|spec| self.resolve_spec(spec))
            .collect::<CoordinatorResult<Vec<_>>>()?;
        let digests: Vec<String> = specs
            .iter()
            .flat_map(|spec| spec.payload.input_digests.iter().cloned())
            .collect();
        self.retain_blobs(&digests).await?;

        let tasks = match self.tasks.insert_tasks(decision_id, &specs).await {
            Ok(tasks) => tasks,
            Err(e) => {
                self.release_blobs(&digests).await;
                return Err(e);
            }
        };
        if let Err(e) = self.progress.refresh(decision_id).await {
            warn!(decision_id, "推送决策进度失败: {}", e);
        }

        // 入队失败的任务留在 PENDING，由 requeue_orphans 补回队列
        for task in &tasks {
            self.enqueue_task(task).await?;
        }

        counter!("coordinator_tasks_created_total").increment(tasks.len() as u64);
        info!(decision_id, count = tasks.len(), "已创建任务");
        Ok(tasks)
    }

    fn resolve_spec(&self, mut spec: TaskSpec) -> CoordinatorResult<TaskSpec> {
        let queue = spec
            .queue
            .take()
            .map(|q| q.trim().to_string())
            .unwrap_or_else(|| self.config.default_queue.clone());
        if queue.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "任务队列名不能为空".to_string(),
            ));
        }
        spec.queue = Some(queue);
        Ok(spec)
    }

    /// 为节点领取下一个任务
    ///
    /// 调度器从与其类型同名的队列领取，能力过滤使用节点当前剩余容量。
    /// 节点预留失败时条目立即放回队列并返回空。
    pub async fn claim_next(
        &self,
        scheduler_id: &str,
        node_id: &str,
    ) -> CoordinatorResult<Option<Task>> {
        let (scheduler, node) = self.registry.claim_target(scheduler_id, node_id).await?;
        if !node.is_healthy() {
            debug!(node_id, status = %node.status, "节点不健康，跳过领取");
            return Ok(None);
        }
        let capabilities = node.free_capabilities();

        loop {
            let Some(entry) = self
                .queue
                .claim(&scheduler.scheduler_type, &capabilities)
                .await?
            else {
                return Ok(None);
            };

            match self.claim_entry(&scheduler.id, node_id, &entry).await {
                Ok(ClaimOutcome::Claimed(task)) => return Ok(Some(task)),
                Ok(ClaimOutcome::Stale) => continue,
                Ok(ClaimOutcome::Rejected) => {
                    self.queue.restore(&entry).await?;
                    counter!("coordinator_reservations_rejected_total").increment(1);
                    debug!(task_id = entry.task_id, node_id, "节点预留失败，任务放回队列");
                    return Ok(None);
                }
                Err(e) => {
                    if let Err(restore_err) = self.queue.restore(&entry).await {
                        warn!(task_id = entry.task_id, "放回队列条目失败: {}", restore_err);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn claim_entry(
        &self,
        scheduler_id: &str,
        node_id: &str,
        entry: &QueueEntry,
    ) -> CoordinatorResult<ClaimOutcome> {
        let _guard = self
            .locks
            .acquire(
                &[LockKey::task(entry.task_id), LockKey::node(node_id)],
                "claim-task",
            )
            .await?;

        let Some(task) = self.tasks.get_task(entry.task_id).await? else {
            warn!(task_id = entry.task_id, "队列条目对应的任务不存在，丢弃");
            return Ok(ClaimOutcome::Stale);
        };
        if task.state != TaskState::Pending {
            debug!(task_id = task.id, state = %task.state, "队列条目已过期，丢弃");
            return Ok(ClaimOutcome::Stale);
        }

        if !self.registry.reserve(node_id, &task.resources).await? {
            return Ok(ClaimOutcome::Rejected);
        }

        let mut next = task.clone();
        next.state = TaskState::Processing;
        next.node_id = Some(node_id.to_string());
        next.scheduler_id = Some(scheduler_id.to_string());
        next.claimed_at = Some(Utc::now());
        next.finished_at = None;
        next.progress = None;
        let delta = ProgressDelta::transition(TaskState::Pending, TaskState::Processing);
        if let Err(e) = self.commit_transition(&next, TaskState::Pending, delta).await {
            self.registry.release(node_id, &task.resources).await?;
            return Err(e);
        }

        counter!("coordinator_task_claims_total").increment(1);
        info!(task_id = next.id, node_id, scheduler_id, "任务已被领取");
        Ok(ClaimOutcome::Claimed(next))
    }

    /// 更新展示用进度，不改变状态
    pub async fn report_progress(
        &self,
        task_id: i64,
        info: &serde_json::Value,
    ) -> CoordinatorResult<()> {
        let _guard = self.lock_task(task_id, "report-progress").await?;
        let task = self.load_task(task_id).await?;
        if task.state != TaskState::Processing {
            return Err(CoordinatorError::NotInProcessing {
                task_id,
                state: task.state.to_string(),
            });
        }
        self.tasks.update_progress_info(task_id, info).await
    }

    /// 处理成功上报
    ///
    /// 调用方已经为 `result.output_digest` 取得了一次引用：
    /// 任务进入 FINISHED 时引用归任务所有，其余情况（重复上报、取消、错误）在这里释放。
    pub async fn report_success(
        &self,
        task_id: i64,
        node_id: Option<&str>,
        result: ResultPayload,
    ) -> CoordinatorResult<Task> {
        let outcome = self.apply_success(task_id, node_id, &result).await;
        if !matches!(outcome, Ok(SuccessOutcome::Finished(_))) {
            self.release_blobs(std::slice::from_ref(&result.output_digest))
                .await;
        }

        match outcome? {
            SuccessOutcome::Finished(task) | SuccessOutcome::Cancelled(task) => {
                self.finalize_if_complete(task.decision_id).await?;
                Ok(task)
            }
            SuccessOutcome::Duplicate(task) => Ok(task),
        }
    }

    async fn apply_success(
        &self,
        task_id: i64,
        node_id: Option<&str>,
        result: &ResultPayload,
    ) -> CoordinatorResult<SuccessOutcome> {
        let _guard = self.lock_task(task_id, "report-success").await?;
        let task = self.load_task(task_id).await?;
        match task.state {
            TaskState::Finished => {
                debug!(task_id, "重复的成功上报，忽略");
                counter!("coordinator_duplicate_reports_total").increment(1);
                return Ok(SuccessOutcome::Duplicate(task));
            }
            TaskState::Processing => {}
            state => return Err(invalid_transition(task_id, state, TaskState::Finished)),
        }
        Self::check_owner(&task, node_id, TaskState::Finished)?;

        if task.cancel_requested {
            return Ok(SuccessOutcome::Cancelled(self.settle_cancelled(task).await?));
        }

        let mut next = task.clone();
        next.state = TaskState::Finished;
        next.finished_at = Some(Utc::now());
        next.output_digest = Some(result.output_digest.clone());
        let delta = ProgressDelta::transition(TaskState::Processing, TaskState::Finished)
            .with_duration(next.processing_duration_ms())
            .with_usage(result.resource_usage);
        self.commit_transition(&next, TaskState::Processing, delta)
            .await?;
        self.release_node(&task).await?;

        counter!("coordinator_task_transitions_total", "to" => TaskState::Finished.as_str())
            .increment(1);
        info!(task_id, digest = %result.output_digest, "任务已完成");
        Ok(SuccessOutcome::Finished(next))
    }

    /// 处理失败上报
    ///
    /// 瞬时失败且重试次数未达上限时任务回到 PENDING 并重新入队，否则停留在 ERROR。
    pub async fn report_failure(
        &self,
        task_id: i64,
        node_id: Option<&str>,
        failure: TaskFailure,
    ) -> CoordinatorResult<Task> {
        let (task, terminal) = {
            let _guard = self.lock_task(task_id, "report-failure").await?;
            let task = self.load_task(task_id).await?;
            match task.state {
                TaskState::Error => {
                    debug!(task_id, "重复的失败上报，忽略");
                    counter!("coordinator_duplicate_reports_total").increment(1);
                    return Ok(task);
                }
                TaskState::Processing => {}
                state => return Err(invalid_transition(task_id, state, TaskState::Error)),
            }
            Self::check_owner(&task, node_id, TaskState::Error)?;

            if task.cancel_requested {
                (self.settle_cancelled(task).await?, true)
            } else {
                self.fail_locked(task, &failure.message, failure.transient)
                    .await?
            }
        };

        if terminal {
            self.finalize_if_complete(task.decision_id).await?;
        }
        Ok(task)
    }

    /// 取消单个任务
    ///
    /// PENDING 任务立即移出队列并进入 CANCELLED；PROCESSING 任务只设置取消标志，
    /// 等待 worker 确认。已经到达终态的任务原样返回。
    pub async fn cancel_task(&self, task_id: i64) -> CoordinatorResult<Task> {
        self.cancel_inner(task_id, false).await
    }

    /// 强制取消：PROCESSING 任务不等待确认直接进入 CANCELLED
    ///
    /// 仅在删除决策时使用，任务不能比所属决策存活更久。
    pub async fn force_cancel(&self, task_id: i64) -> CoordinatorResult<Task> {
        self.cancel_inner(task_id, true).await
    }

    async fn cancel_inner(&self, task_id: i64, force: bool) -> CoordinatorResult<Task> {
        let (task, terminal) = {
            let _guard = self.lock_task(task_id, "cancel-task").await?;
            let task = self.load_task(task_id).await?;
            match task.state {
                TaskState::Pending => {
                    self.queue.remove(&task.queue, task.id).await?;
                    (self.settle_cancelled(task).await?, true)
                }
                TaskState::Processing if force => (self.settle_cancelled(task).await?, true),
                TaskState::Processing => {
                    if task.cancel_requested {
                        (task, false)
                    } else {
                        let mut next = task;
                        next.cancel_requested = true;
                        self.commit(&next, TaskState::Processing).await?;
                        info!(task_id, node_id = ?next.node_id, "已请求协作式取消");
                        (next, false)
                    }
                }
                _ => (task, false),
            }
        };

        if terminal {
            self.finalize_if_complete(task.decision_id).await?;
        }
        Ok(task)
    }

    /// worker 确认取消
    pub async fn acknowledge_cancel(
        &self,
        task_id: i64,
        node_id: Option<&str>,
    ) -> CoordinatorResult<Task> {
        let task = {
            let _guard = self.lock_task(task_id, "ack-cancel").await?;
            let task = self.load_task(task_id).await?;
            match task.state {
                TaskState::Cancelled => return Ok(task),
                TaskState::Processing if task.cancel_requested => {
                    Self::check_owner(&task, node_id, TaskState::Cancelled)?;
                    self.settle_cancelled(task).await?
                }
                state => return Err(invalid_transition(task_id, state, TaskState::Cancelled)),
            }
        };

        self.finalize_if_complete(task.decision_id).await?;
        Ok(task)
    }

    /// 回收卡住的任务
    ///
    /// 仅当任务仍是同一次领取（`claimed_at` 未变）时生效，
    /// 因此同一次卡住最多被回收一次。返回 None 表示任务已被其他路径处理。
    pub async fn reclaim_stuck(
        &self,
        task_id: i64,
        claimed_at: Option<DateTime<Utc>>,
    ) -> CoordinatorResult<Option<Task>> {
        let (task, terminal) = {
            let _guard = self.lock_task(task_id, "reclaim-stuck").await?;
            let Some(task) = self.tasks.get_task(task_id).await? else {
                return Ok(None);
            };
            if task.state != TaskState::Processing || task.claimed_at != claimed_at {
                return Ok(None);
            }

            if task.cancel_requested {
                (self.settle_cancelled(task).await?, true)
            } else {
                self.fail_locked(task, "调度器失联，任务认领超时", true)
                    .await?
            }
        };

        if terminal {
            self.finalize_if_complete(task.decision_id).await?;
        }
        Ok(Some(task))
    }

    /// 把不在队列中的 PENDING 任务补回队列
    ///
    /// 领取时出队成功但任务没有转为 PROCESSING（进程在两步之间退出、放回失败），
    /// 或新建/重试后入队失败，都会留下这样的任务。只检查创建时间早于
    /// `created_before` 的任务，避免与仍在入队的 `create_tasks` 竞争。
    pub async fn requeue_orphans(&self, created_before: DateTime<Utc>) -> CoordinatorResult<usize> {
        let mut restored = 0;
        for candidate in self.tasks.find_pending(created_before).await? {
            let _guard = self.lock_task(candidate.id, "requeue-orphan").await?;
            let Some(task) = self.tasks.get_task(candidate.id).await? else {
                continue;
            };
            if task.state != TaskState::Pending {
                continue;
            }
            if self.enqueue_task(&task).await? {
                restored += 1;
                counter!("coordinator_orphaned_tasks_requeued_total").increment(1);
                warn!(task_id = task.id, queue = %task.queue, "PENDING 任务不在队列中，已重新入队");
            }
        }
        Ok(restored)
    }

    pub async fn task_status(&self, task_id: i64) -> CoordinatorResult<Task> {
        self.load_task(task_id).await
    }

    /// 决策的全部任务到达终态时结束决策
    ///
    /// 取消中的决策进入 CANCELLED；已封存的运行中决策按是否有 ERROR 任务
    /// 进入 FAILED 或 FINISHED。作业状态随之更新。
    pub async fn finalize_if_complete(&self, decision_id: i64) -> CoordinatorResult<Option<Decision>> {
        let _guard = self
            .locks
            .acquire(&[LockKey::decision(decision_id)], "finalize-decision")
            .await?;

        let Some(decision) = self.decisions.get_decision(decision_id).await? else {
            return Ok(None);
        };
        let cancelling = match decision.status {
            DecisionStatus::Cancelling => true,
            DecisionStatus::Running if decision.sealed => false,
            _ => return Ok(None),
        };

        let progress = self.progress.get(decision_id).await?;
        if progress.non_terminal() > 0 {
            return Ok(None);
        }

        let status = if cancelling {
            DecisionStatus::Cancelled
        } else if progress.error > 0 {
            DecisionStatus::Failed
        } else {
            DecisionStatus::Finished
        };
        self.decisions
            .update_decision_status(decision_id, status)
            .await?;
        self.jobs
            .update_job_status(decision.job_id, status.job_status())
            .await?;
        info!(
            decision_id,
            job_id = decision.job_id,
            status = %status,
            finished = progress.finished,
            error = progress.error,
            cancelled = progress.cancelled,
            "决策已结束"
        );

        self.decisions.get_decision(decision_id).await
    }

    /// 失败处理，调用方必须持有任务锁且任务处于 PROCESSING
    ///
    /// 返回更新后的任务以及它是否进入了终态。
    async fn fail_locked(
        &self,
        task: Task,
        message: &str,
        transient: bool,
    ) -> CoordinatorResult<(Task, bool)> {
        let retry = transient && task.retry_count < self.config.max_retries;
        let mut next = task.clone();
        next.retry_count = task.retry_count + 1;
        next.last_error = Some(message.to_string());

        if retry {
            next.state = TaskState::Pending;
            next.node_id = None;
            next.scheduler_id = None;
            next.claimed_at = None;
            next.progress = None;
            let delta = ProgressDelta::transition(TaskState::Processing, TaskState::Pending);
            self.commit_transition(&next, TaskState::Processing, delta)
                .await?;
            self.release_node(&task).await?;
            self.enqueue_task(&next).await?;
            counter!("coordinator_task_retries_total").increment(1);
            warn!(
                task_id = next.id,
                retry_count = next.retry_count,
                max_retries = self.config.max_retries,
                "任务瞬时失败，重新排队: {}",
                message
            );
            return Ok((next, false));
        }

        next.state = TaskState::Error;
        next.finished_at = Some(Utc::now());
        let delta = ProgressDelta::transition(TaskState::Processing, TaskState::Error);
        self.commit_transition(&next, TaskState::Processing, delta)
            .await?;
        self.release_node(&task).await?;
        counter!("coordinator_task_transitions_total", "to" => TaskState::Error.as_str())
            .increment(1);
        warn!(
            task_id = next.id,
            retry_count = next.retry_count,
            transient,
            "任务失败: {}",
            message
        );
        Ok((next, true))
    }

    /// 进入 CANCELLED，调用方必须持有任务锁
    async fn settle_cancelled(&self, task: Task) -> CoordinatorResult<Task> {
        let from = task.state;
        let mut next = task.clone();
        next.state = TaskState::Cancelled;
        next.finished_at = Some(Utc::now());
        self.commit_transition(&next, from, ProgressDelta::transition(from, TaskState::Cancelled))
            .await?;
        if from == TaskState::Processing {
            self.release_node(&task).await?;
        }

        counter!("coordinator_task_transitions_total", "to" => TaskState::Cancelled.as_str())
            .increment(1);
        info!(task_id = next.id, from = %from, "任务已取消");
        Ok(next)
    }

    /// 只改字段不改状态的写回
    async fn commit(&self, task: &Task, expected: TaskState) -> CoordinatorResult<()> {
        if self.tasks.compare_and_update(task, expected).await? {
            Ok(())
        } else {
            Err(left_state(task.id, expected))
        }
    }

    /// 状态转换与计数器在同一事务中提交，提交成功后推送进度
    async fn commit_transition(
        &self,
        task: &Task,
        expected: TaskState,
        delta: ProgressDelta,
    ) -> CoordinatorResult<()> {
        match self.tasks.transition(task, expected, &delta).await? {
            Some(progress) => {
                self.progress.publish(&progress);
                Ok(())
            }
            None => Err(left_state(task.id, expected)),
        }
    }

    /// 入队，任务已在队列中时什么也不做，返回是否新入队
    async fn enqueue_task(&self, task: &Task) -> CoordinatorResult<bool> {
        if self.queue.contains(&task.queue, task.id).await? {
            return Ok(false);
        }
        self.queue
            .enqueue(&task.queue, task.id, task.priority, &task.resources)
            .await?;
        Ok(true)
    }

    async fn release_node(&self, task: &Task) -> CoordinatorResult<()> {
        if let Some(node_id) = &task.node_id {
            self.registry.release(node_id, &task.resources).await?;
        }
        Ok(())
    }

    fn check_owner(task: &Task, node_id: Option<&str>, to: TaskState) -> CoordinatorResult<()> {
        match node_id {
            Some(node_id) if !task.is_owned_by(node_id) => {
                warn!(
                    task_id = task.id,
                    reporter = node_id,
                    owner = ?task.node_id,
                    "非领取节点的上报被拒绝"
                );
                Err(CoordinatorError::InvalidTransition {
                    task_id: task.id,
                    from: format!(
                        "{} (属于节点 {})",
                        task.state,
                        task.node_id.as_deref().unwrap_or("-")
                    ),
                    to: to.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn lock_task(&self, task_id: i64, label: &str) -> CoordinatorResult<LockGuard> {
        self.locks.acquire(&[LockKey::task(task_id)], label).await
    }

    async fn load_task(&self, task_id: i64) -> CoordinatorResult<Task> {
        self.tasks
            .get_task(task_id)
            .await?
            .ok_or(CoordinatorError::TaskNotFound { id: task_id })
    }

    async fn load_decision(&self, decision_id: i64) -> CoordinatorResult<Decision> {
        self.decisions
            .get_decision(decision_id)
            .await?
            .ok_or(CoordinatorError::DecisionNotFound { id: decision_id })
    }

    /// 依次取得引用，中途失败时归还已取得的引用
    pub(crate) async fn retain_blobs(&self, digests: &[String]) -> CoordinatorResult<()> {
        for (index, digest) in digests.iter().enumerate() {
            if let Err(e) = self.blobs.retain(digest).await {
                self.release_blobs(&digests[..index]).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// 归还引用；单个失败只记录日志，不中断其余释放
    pub(crate) async fn release_blobs(&self, digests: &[String]) {
        for digest in digests {
            if let Err(e) = self.blobs.release(digest).await {
                warn!(digest = %digest, "释放Blob引用失败: {}", e);
            }
        }
    }
}

fn left_state(task_id: i64, expected: TaskState) -> CoordinatorError {
    CoordinatorError::InvariantViolation(format!(
        "任务 {} 在持锁期间离开了 {} 状态",
        task_id, expected
    ))
}

fn invalid_transition(task_id: i64, from: TaskState, to: TaskState) -> CoordinatorError {
    CoordinatorError::InvalidTransition {
        task_id,
        from: from.to_string(),
        to: to.to_string(),
    }
}
