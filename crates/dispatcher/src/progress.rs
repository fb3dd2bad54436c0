use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use coordinator_core::{
    models::{DecisionProgress, ProgressSummary},
    traits::ProgressRepository,
    CoordinatorError, CoordinatorResult,
};
use tokio::sync::watch;
use tracing::debug;

/// 决策进度聚合器
///
/// 计数器本身保存在存储中并按增量更新；这里额外为每个被订阅的决策
/// 维护一个 `watch` 通道，生产者可以观察每一次计数变化。
pub struct ProgressAggregator {
    repository: Arc<dyn ProgressRepository>,
    channels: Mutex<HashMap<i64, watch::Sender<DecisionProgress>>>,
}

impl ProgressAggregator {
    pub fn new(repository: Arc<dyn ProgressRepository>) -> Self {
        Self {
            repository,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<i64, watch::Sender<DecisionProgress>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 把已经提交的计数器推送给订阅者
    ///
    /// 计数器由任务仓储在状态转换的事务中更新，这里只负责通知。
    /// 比订阅者已看到的值更旧的快照被丢弃。
    pub fn publish(&self, progress: &DecisionProgress) {
        debug!(
            decision_id = progress.decision_id,
            pending = progress.pending,
            processing = progress.processing,
            finished = progress.finished,
            error = progress.error,
            cancelled = progress.cancelled,
            "决策进度已更新"
        );
        let mut channels = self.channels();
        if let Some(sender) = channels.get(&progress.decision_id) {
            if sender.receiver_count() == 0 {
                channels.remove(&progress.decision_id);
            } else {
                sender.send_if_modified(|current| {
                    if progress.updated_at < current.updated_at {
                        return false;
                    }
                    *current = progress.clone();
                    true
                });
            }
        }
    }

    /// 读取存储中的最新计数器并推送
    pub async fn refresh(&self, decision_id: i64) -> CoordinatorResult<DecisionProgress> {
        let progress = self.get(decision_id).await?;
        self.publish(&progress);
        Ok(progress)
    }

    pub async fn get(&self, decision_id: i64) -> CoordinatorResult<DecisionProgress> {
        self.repository
            .get_progress(decision_id)
            .await?
            .ok_or(CoordinatorError::DecisionNotFound { id: decision_id })
    }

    /// 计数器加上预计剩余时间
    pub async fn summary(&self, decision_id: i64) -> CoordinatorResult<ProgressSummary> {
        Ok(self.get(decision_id).await?.summary())
    }

    /// 订阅决策进度，接收端立即可以读到当前值
    pub async fn subscribe(
        &self,
        decision_id: i64,
    ) -> CoordinatorResult<watch::Receiver<DecisionProgress>> {
        let current = self.get(decision_id).await?;
        let mut channels = self.channels();
        let sender = channels
            .entry(decision_id)
            .or_insert_with(|| watch::channel(current.clone()).0);
        if sender.receiver_count() == 0 {
            sender.send_replace(current);
        }
        Ok(sender.subscribe())
    }

    /// 决策被删除后丢弃它的通道，订阅者会观察到发送端关闭
    pub fn forget(&self, decision_id: i64) {
        self.channels().remove(&decision_id);
    }

    pub fn subscriber_count(&self, decision_id: i64) -> usize {
        self.channels()
            .get(&decision_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}
