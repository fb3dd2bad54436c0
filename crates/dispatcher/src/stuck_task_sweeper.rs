use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coordinator_core::{
    config::LifecycleConfig, models::TaskState, traits::TaskRepository, CoordinatorResult,
    LockKey, LockManager,
};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::lifecycle::TaskLifecycleManager;
use crate::periodic::{LoopControl, PeriodicService};
use crate::registry::SchedulerRegistry;

const SWEEP_LOCK: &str = "stuck-task-sweep";
/// 新建任务在这段时间内可能仍在入队，补队列时跳过
const ORPHAN_GRACE_SECONDS: i64 = 30;

/// 卡住任务扫描配置
#[derive(Debug, Clone)]
pub struct StuckTaskSweeperConfig {
    /// 领取后超过该时长仍未完成的任务才会被检查
    pub stuck_task_timeout_seconds: u64,
    /// 扫描间隔（秒）
    pub sweep_interval_seconds: u64,
}

impl Default for StuckTaskSweeperConfig {
    fn default() -> Self {
        Self {
            stuck_task_timeout_seconds: 600, // 10分钟
            sweep_interval_seconds: 60,
        }
    }
}

impl From<&LifecycleConfig> for StuckTaskSweeperConfig {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            stuck_task_timeout_seconds: config.stuck_task_timeout_seconds,
            sweep_interval_seconds: config.sweep_interval_seconds,
        }
    }
}

/// 单次扫描结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// 超时的 PROCESSING 任务数
    pub examined: usize,
    /// 调度器仍然在线，暂不处理
    pub skipped_alive: usize,
    pub requeued: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// 不在队列中、被补回队列的 PENDING 任务
    pub restored: usize,
}

/// 卡住任务扫描器
///
/// 领取超时且所属调度器失联的任务按瞬时失败处理：释放资源并重新排队，
/// 超过重试上限则进入 ERROR；已请求取消的任务直接进入 CANCELLED。
/// 每次扫描还会把不在队列中的 PENDING 任务补回队列，启动后的第一次扫描
/// 因此也负责恢复上次进程退出时丢失的队列条目。
/// 扫描在命名锁内进行，多个扫描不会重叠。
pub struct StuckTaskSweeper {
    tasks: Arc<dyn TaskRepository>,
    registry: Arc<SchedulerRegistry>,
    lifecycle: Arc<TaskLifecycleManager>,
    locks: LockManager,
    config: StuckTaskSweeperConfig,
    control: LoopControl,
}

impl StuckTaskSweeper {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        registry: Arc<SchedulerRegistry>,
        lifecycle: Arc<TaskLifecycleManager>,
        locks: LockManager,
        config: Option<StuckTaskSweeperConfig>,
    ) -> Self {
        Self {
            tasks,
            registry,
            lifecycle,
            locks,
            config: config.unwrap_or_default(),
            control: LoopControl::new(),
        }
    }

    fn stuck_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.config.stuck_task_timeout_seconds).unwrap_or(i64::MAX / 1000),
        )
    }

    /// 执行一次扫描；另一个扫描正在进行时直接返回空结果
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> CoordinatorResult<SweepReport> {
        let Some(_guard) = self
            .locks
            .try_acquire(&[LockKey::named(SWEEP_LOCK)], SWEEP_LOCK)
        else {
            debug!("上一次卡住任务扫描仍在进行，跳过");
            return Ok(SweepReport::default());
        };

        let mut report = SweepReport::default();
        let stuck = self.tasks.find_stuck(now - self.stuck_timeout()).await?;
        report.examined = stuck.len();

        for task in stuck {
            let scheduler_alive = match &task.scheduler_id {
                Some(scheduler_id) => self.registry.is_scheduler_alive(scheduler_id, now).await?,
                None => false,
            };
            if scheduler_alive {
                report.skipped_alive += 1;
                continue;
            }

            warn!(
                task_id = task.id,
                scheduler_id = ?task.scheduler_id,
                node_id = ?task.node_id,
                claimed_at = ?task.claimed_at,
                "发现卡住的任务"
            );
            let Some(reclaimed) = self.lifecycle.reclaim_stuck(task.id, task.claimed_at).await?
            else {
                continue;
            };
            match reclaimed.state {
                TaskState::Pending => {
                    report.requeued += 1;
                    counter!("coordinator_sweep_requeues_total").increment(1);
                }
                TaskState::Error => report.failed += 1,
                TaskState::Cancelled => report.cancelled += 1,
                _ => {}
            }
        }

        report.restored = self
            .lifecycle
            .requeue_orphans(now - chrono::Duration::seconds(ORPHAN_GRACE_SECONDS))
            .await?;

        if report.requeued + report.failed + report.cancelled + report.restored > 0 {
            info!(
                examined = report.examined,
                requeued = report.requeued,
                failed = report.failed,
                cancelled = report.cancelled,
                restored = report.restored,
                "卡住任务扫描完成"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicService for StuckTaskSweeper {
    fn name(&self) -> &'static str {
        "stuck-task-sweeper"
    }

    async fn start(&self) -> CoordinatorResult<()> {
        info!(
            interval_seconds = self.config.sweep_interval_seconds,
            timeout_seconds = self.config.stuck_task_timeout_seconds,
            "启动卡住任务扫描"
        );
        self.control.set_running().await;
        let interval = Duration::from_secs(self.config.sweep_interval_seconds);

        while self.control.is_running().await {
            if let Err(e) = self.sweep_once(Utc::now()).await {
                error!("卡住任务扫描出错: {}", e);
            }
            self.control.wait(interval).await;
        }

        info!("卡住任务扫描已停止");
        Ok(())
    }

    async fn stop(&self) -> CoordinatorResult<()> {
        self.control.request_stop().await;
        Ok(())
    }
}
