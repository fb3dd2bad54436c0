use std::sync::Arc;

use coordinator_core::{
    models::{Decision, DecisionStatus, Job, Task, TaskSpec},
    traits::{BlobStore, DecisionRepository, JobRepository, TaskRepository},
    CoordinatorError, CoordinatorResult, LockKey, LockManager,
};
use tracing::{info, warn};

use crate::lifecycle::TaskLifecycleManager;

/// 生产者侧的作业与决策管理
///
/// 任务级别的状态转换全部委托给 [`TaskLifecycleManager`]，
/// 这里只负责决策本身的状态与它持有的 Blob 引用。
pub struct DecisionService {
    jobs: Arc<dyn JobRepository>,
    decisions: Arc<dyn DecisionRepository>,
    tasks: Arc<dyn TaskRepository>,
    blobs: Arc<dyn BlobStore>,
    lifecycle: Arc<TaskLifecycleManager>,
    locks: LockManager,
}

impl DecisionService {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        decisions: Arc<dyn DecisionRepository>,
        tasks: Arc<dyn TaskRepository>,
        blobs: Arc<dyn BlobStore>,
        lifecycle: Arc<TaskLifecycleManager>,
        locks: LockManager,
    ) -> Self {
        Self {
            jobs,
            decisions,
            tasks,
            blobs,
            lifecycle,
            locks,
        }
    }

    /// 创建作业；子作业的父作业必须存在
    pub async fn create_job(&self, name: &str, parent_id: Option<i64>) -> CoordinatorResult<Job> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "作业名称不能为空".to_string(),
            ));
        }
        if let Some(parent_id) = parent_id {
            if self.jobs.get_job(parent_id).await?.is_none() {
                return Err(CoordinatorError::JobNotFound { id: parent_id });
            }
        }

        let job = self.jobs.create_job(name, parent_id).await?;
        info!(job_id = job.id, parent_id = ?parent_id, "作业已创建");
        Ok(job)
    }

    pub async fn get_job(&self, id: i64) -> CoordinatorResult<Job> {
        self.jobs
            .get_job(id)
            .await?
            .ok_or(CoordinatorError::JobNotFound { id })
    }

    /// 开始一次新的决策
    ///
    /// 决策持有配置 Blob 的一次引用，删除决策时归还。
    pub async fn start_decision(
        &self,
        job_id: i64,
        configuration_digest: Option<&str>,
    ) -> CoordinatorResult<Decision> {
        self.get_job(job_id).await?;
        if let Some(digest) = configuration_digest {
            self.blobs.retain(digest).await?;
        }

        match self
            .decisions
            .create_decision(job_id, configuration_digest)
            .await
        {
            Ok(decision) => {
                info!(decision_id = decision.id, job_id, "决策已开始");
                Ok(decision)
            }
            Err(e) => {
                if let Some(digest) = configuration_digest {
                    if let Err(release_err) = self.blobs.release(digest).await {
                        warn!(digest, "归还配置Blob引用失败: {}", release_err);
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn get_decision(&self, id: i64) -> CoordinatorResult<Decision> {
        self.decisions
            .get_decision(id)
            .await?
            .ok_or(CoordinatorError::DecisionNotFound { id })
    }

    pub async fn create_tasks(
        &self,
        decision_id: i64,
        specs: Vec<TaskSpec>,
    ) -> CoordinatorResult<Vec<Task>> {
        self.lifecycle.create_tasks(decision_id, specs).await
    }

    /// 封存决策：不再接受新任务，最后一个任务到达终态时自动结束
    pub async fn seal_decision(&self, decision_id: i64) -> CoordinatorResult<Decision> {
        {
            let _guard = self
                .locks
                .acquire(&[LockKey::decision(decision_id)], "seal-decision")
                .await?;
            let decision = self.get_decision(decision_id).await?;
            if !decision.status.is_active() {
                return Err(CoordinatorError::DecisionNotActive { id: decision_id });
            }
            if !decision.sealed {
                self.decisions.seal_decision(decision_id).await?;
                info!(decision_id, "决策已封存");
            }
        }

        self.lifecycle.finalize_if_complete(decision_id).await?;
        self.get_decision(decision_id).await
    }

    /// 取消决策
    ///
    /// 决策先进入 CANCELLING，所有非终态任务被取消；
    /// 只有最后一个任务到达终态后决策才进入 CANCELLED。
    pub async fn cancel_decision(&self, decision_id: i64) -> CoordinatorResult<Decision> {
        if !self.begin_cancelling(decision_id).await? {
            return self.get_decision(decision_id).await;
        }

        for task in self.tasks.list_non_terminal(decision_id).await? {
            self.lifecycle.cancel_task(task.id).await?;
        }
        self.lifecycle.finalize_if_complete(decision_id).await?;
        self.get_decision(decision_id).await
    }

    /// 进入 CANCELLING，决策已结束时返回 false
    async fn begin_cancelling(&self, decision_id: i64) -> CoordinatorResult<bool> {
        let _guard = self
            .locks
            .acquire(&[LockKey::decision(decision_id)], "cancel-decision")
            .await?;
        let decision = self.get_decision(decision_id).await?;
        match decision.status {
            DecisionStatus::Running => {
                self.decisions
                    .update_decision_status(decision_id, DecisionStatus::Cancelling)
                    .await?;
                info!(decision_id, "决策进入取消中状态");
                Ok(true)
            }
            DecisionStatus::Cancelling => Ok(true),
            _ => Ok(false),
        }
    }

    /// 删除决策
    ///
    /// 非终态任务被强制取消，随后删除决策、任务和计数器，
    /// 最后归还决策持有的全部 Blob 引用（配置、任务输入、任务输出）。
    pub async fn delete_decision(&self, decision_id: i64) -> CoordinatorResult<()> {
        let decision = self.get_decision(decision_id).await?;

        if self.begin_cancelling(decision_id).await? {
            for task in self.tasks.list_non_terminal(decision_id).await? {
                self.lifecycle.force_cancel(task.id).await?;
            }
            self.lifecycle.finalize_if_complete(decision_id).await?;
        }

        let mut digests: Vec<String> = decision.configuration_digest.into_iter().collect();
        digests.extend(self.tasks.list_input_digests(decision_id).await?);
        digests.extend(
            self.tasks
                .list_by_decision(decision_id)
                .await?
                .into_iter()
                .filter_map(|task| task.output_digest),
        );

        {
            let _guard = self
                .locks
                .acquire(&[LockKey::decision(decision_id)], "delete-decision")
                .await?;
            self.decisions.delete_decision(decision_id).await?;
        }
        self.lifecycle.release_blobs(&digests).await;
        self.lifecycle.progress().forget(decision_id);

        info!(
            decision_id,
            released_blobs = digests.len(),
            "决策已删除"
        );
        Ok(())
    }
}
