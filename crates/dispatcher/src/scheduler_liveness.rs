use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coordinator_core::{config::RegistryConfig, models::SchedulerInfo, CoordinatorResult};
use tracing::{debug, error, info};

use crate::periodic::{LoopControl, PeriodicService};
use crate::registry::SchedulerRegistry;

/// 调度器存活监测
///
/// 心跳超时的调度器被标记为失联、其节点标记为不可达。
/// 这里不重新分配任务，卡住任务由 [`crate::StuckTaskSweeper`] 处理。
pub struct SchedulerLivenessMonitor {
    registry: Arc<SchedulerRegistry>,
    config: RegistryConfig,
    control: LoopControl,
}

impl SchedulerLivenessMonitor {
    pub fn new(registry: Arc<SchedulerRegistry>, config: Option<RegistryConfig>) -> Self {
        Self {
            registry,
            config: config.unwrap_or_default(),
            control: LoopControl::new(),
        }
    }

    /// 检查一次，返回本次被标记为失联的调度器
    pub async fn check_once(&self, now: DateTime<Utc>) -> CoordinatorResult<Vec<SchedulerInfo>> {
        let window = chrono::Duration::seconds(self.registry.heartbeat_timeout_seconds());
        let expired = self.registry.find_expired(now - window).await?;

        for scheduler in &expired {
            debug!(
                scheduler_id = %scheduler.id,
                last_heartbeat = %scheduler.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC"),
                "调度器心跳超时"
            );
            self.registry.mark_disconnected(&scheduler.id).await?;
        }
        Ok(expired)
    }
}

#[async_trait]
impl PeriodicService for SchedulerLivenessMonitor {
    fn name(&self) -> &'static str {
        "scheduler-liveness"
    }

    async fn start(&self) -> CoordinatorResult<()> {
        info!(
            timeout_seconds = self.config.heartbeat_timeout_seconds,
            "启动调度器存活监测"
        );
        self.control.set_running().await;
        let interval = Duration::from_secs(self.config.liveness_check_interval_seconds);

        while self.control.is_running().await {
            match self.check_once(Utc::now()).await {
                Ok(expired) if !expired.is_empty() => {
                    info!("{} 个调度器被标记为失联", expired.len());
                }
                Ok(_) => {}
                Err(e) => error!("调度器存活检查出错: {}", e),
            }
            self.control.wait(interval).await;
        }

        info!("调度器存活监测已停止");
        Ok(())
    }

    async fn stop(&self) -> CoordinatorResult<()> {
        self.control.request_stop().await;
        Ok(())
    }
}
