use std::time::Duration;

use async_trait::async_trait;
use coordinator_core::CoordinatorResult;
use tokio::sync::{Notify, RwLock};

/// 周期性后台服务接口
#[async_trait]
pub trait PeriodicService: Send + Sync {
    fn name(&self) -> &'static str;

    /// 运行循环，直到 `stop` 被调用
    async fn start(&self) -> CoordinatorResult<()>;

    async fn stop(&self) -> CoordinatorResult<()>;
}

/// 循环的运行标志与唤醒信号
#[derive(Debug, Default)]
pub struct LoopControl {
    running: RwLock<bool>,
    wake: Notify,
}

impl LoopControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_running(&self) {
        *self.running.write().await = true;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn request_stop(&self) {
        *self.running.write().await = false;
        self.wake.notify_one();
    }

    /// 等待下一个周期；收到停止信号时提前返回
    pub async fn wait(&self, interval: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.wake.notified() => {}
        }
    }
}
