use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use coordinator_core::{
    config::RegistryConfig,
    models::{NodeInfo, NodeSnapshot, NodeStatus, ResourceRequest, SchedulerInfo, SchedulerStatus},
    traits::RegistryRepository,
    CoordinatorError, CoordinatorResult,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 带存活状态与节点列表的调度器视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerView {
    #[serde(flatten)]
    pub scheduler: SchedulerInfo,
    pub alive: bool,
    pub nodes: Vec<NodeInfo>,
}

/// 调度器/节点注册表
///
/// 注册与心跳由调度器进程驱动；存活性由心跳时间推导。
/// 节点负载的预留与释放都是存储层的单条条件更新，任意交错下都不会越界。
pub struct SchedulerRegistry {
    repository: Arc<dyn RegistryRepository>,
    config: RegistryConfig,
}

impl SchedulerRegistry {
    pub fn new(repository: Arc<dyn RegistryRepository>, config: RegistryConfig) -> Self {
        Self { repository, config }
    }

    pub fn heartbeat_timeout_seconds(&self) -> i64 {
        i64::try_from(self.config.heartbeat_timeout_seconds).unwrap_or(i64::MAX)
    }

    /// 注册或重新注册调度器
    ///
    /// 未提供标识时生成一个新的标识。
    pub async fn register(
        &self,
        id: Option<&str>,
        scheduler_type: &str,
    ) -> CoordinatorResult<SchedulerInfo> {
        let scheduler_type = scheduler_type.trim();
        if scheduler_type.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "调度器类型不能为空".to_string(),
            ));
        }
        let id = match id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            Some(_) => {
                return Err(CoordinatorError::InvalidArgument(
                    "调度器ID不能为空".to_string(),
                ))
            }
            None => Uuid::new_v4().to_string(),
        };

        let scheduler = self
            .repository
            .upsert_scheduler(&id, scheduler_type, Utc::now())
            .await?;
        info!(scheduler_id = %scheduler.id, scheduler_type, "调度器已注册");
        Ok(scheduler)
    }

    /// 处理心跳：刷新存活时间并以快照替换节点集合
    pub async fn heartbeat(
        &self,
        scheduler_id: &str,
        nodes: &[NodeSnapshot],
    ) -> CoordinatorResult<Vec<NodeInfo>> {
        let mut seen = HashSet::new();
        for node in nodes {
            if node.id.trim().is_empty() {
                return Err(CoordinatorError::InvalidArgument(
                    "节点ID不能为空".to_string(),
                ));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(CoordinatorError::InvalidArgument(format!(
                    "心跳中节点 {} 重复",
                    node.id
                )));
            }
        }

        let now = Utc::now();
        if !self.repository.touch_heartbeat(scheduler_id, now).await? {
            return Err(CoordinatorError::SchedulerNotFound {
                id: scheduler_id.to_string(),
            });
        }
        let nodes = self.repository.replace_nodes(scheduler_id, nodes, now).await?;
        debug!(scheduler_id, nodes = nodes.len(), "收到调度器心跳");
        Ok(nodes)
    }

    pub async fn get_scheduler(&self, id: &str) -> CoordinatorResult<SchedulerInfo> {
        self.repository
            .get_scheduler(id)
            .await?
            .ok_or_else(|| CoordinatorError::SchedulerNotFound { id: id.to_string() })
    }

    pub async fn list(&self) -> CoordinatorResult<Vec<SchedulerView>> {
        let now = Utc::now();
        let timeout = self.heartbeat_timeout_seconds();
        let mut views = Vec::new();
        for scheduler in self.repository.list_schedulers().await? {
            let nodes = self.repository.list_nodes(&scheduler.id).await?;
            views.push(SchedulerView {
                alive: self.is_alive(&scheduler, now, timeout),
                scheduler,
                nodes,
            });
        }
        Ok(views)
    }

    fn is_alive(&self, scheduler: &SchedulerInfo, now: DateTime<Utc>, timeout: i64) -> bool {
        scheduler.status == SchedulerStatus::Connected && scheduler.is_alive(now, timeout)
    }

    /// 调度器是否仍然存活；不存在的调度器视为失联
    pub async fn is_scheduler_alive(
        &self,
        scheduler_id: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        Ok(match self.repository.get_scheduler(scheduler_id).await? {
            Some(scheduler) => self.is_alive(&scheduler, now, self.heartbeat_timeout_seconds()),
            None => false,
        })
    }

    /// 领取前的校验：调度器存在且节点归属于它
    pub async fn claim_target(
        &self,
        scheduler_id: &str,
        node_id: &str,
    ) -> CoordinatorResult<(SchedulerInfo, NodeInfo)> {
        let scheduler = self.get_scheduler(scheduler_id).await?;
        let node = self
            .repository
            .get_node(node_id)
            .await?
            .ok_or_else(|| CoordinatorError::NodeNotFound {
                id: node_id.to_string(),
            })?;
        if node.scheduler_id != scheduler.id {
            return Err(CoordinatorError::InvalidArgument(format!(
                "节点 {} 不属于调度器 {}",
                node_id, scheduler_id
            )));
        }
        Ok((scheduler, node))
    }

    pub async fn reserve(
        &self,
        node_id: &str,
        request: &ResourceRequest,
    ) -> CoordinatorResult<bool> {
        self.repository.try_reserve(node_id, request).await
    }

    pub async fn release(&self, node_id: &str, request: &ResourceRequest) -> CoordinatorResult<()> {
        self.repository.release(node_id, request).await
    }

    /// 心跳早于 `before` 且仍标记为在线的调度器
    pub async fn find_expired(&self, before: DateTime<Utc>) -> CoordinatorResult<Vec<SchedulerInfo>> {
        self.repository.find_expired_schedulers(before).await
    }

    /// 标记调度器失联，其节点不可达；不重新分配任何任务
    pub async fn mark_disconnected(&self, scheduler_id: &str) -> CoordinatorResult<()> {
        self.repository
            .set_scheduler_status(scheduler_id, SchedulerStatus::Disconnected)
            .await?;
        self.repository
            .set_nodes_status(scheduler_id, NodeStatus::Unreachable)
            .await?;
        warn!(scheduler_id, "调度器心跳超时，已标记为失联");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_core::models::{NodeCapacity, Workload};
    use coordinator_infrastructure::DatabaseManager;

    async fn registry() -> SchedulerRegistry {
        let db = DatabaseManager::in_memory().await.unwrap();
        SchedulerRegistry::new(db.registry_repository(), RegistryConfig::default())
    }

    fn snapshot(id: &str) -> NodeSnapshot {
        NodeSnapshot {
            id: id.to_string(),
            capacity: NodeCapacity {
                cpu_cores: 4,
                memory_mb: 4096,
            },
            workload: Workload::default(),
            healthy: true,
        }
    }

    #[tokio::test]
    async fn test_register_generates_id() {
        let registry = registry().await;
        let a = registry.register(None, "default").await.unwrap();
        let b = registry.register(None, "default").await.unwrap();
        assert_ne!(a.id, b.id);

        let named = registry.register(Some("sch-fixed"), "gpu").await.unwrap();
        assert_eq!(named.id, "sch-fixed");
        assert_eq!(named.scheduler_type, "gpu");

        assert!(matches!(
            registry.register(None, "  ").await,
            Err(CoordinatorError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let registry = registry().await;
        assert!(matches!(
            registry.heartbeat("ghost", &[snapshot("n1")]).await,
            Err(CoordinatorError::SchedulerNotFound { .. })
        ));

        registry.register(Some("sch-1"), "default").await.unwrap();
        let nodes = registry
            .heartbeat("sch-1", &[snapshot("n1"), snapshot("n2")])
            .await
            .unwrap();
        assert_eq!(nodes.len(), 2);

        assert!(matches!(
            registry
                .heartbeat("sch-1", &[snapshot("n1"), snapshot("n1")])
                .await,
            Err(CoordinatorError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_target_checks_ownership() {
        let registry = registry().await;
        registry.register(Some("sch-1"), "default").await.unwrap();
        registry.register(Some("sch-2"), "default").await.unwrap();
        registry.heartbeat("sch-1", &[snapshot("n1")]).await.unwrap();

        let (scheduler, node) = registry.claim_target("sch-1", "n1").await.unwrap();
        assert_eq!(scheduler.id, "sch-1");
        assert_eq!(node.id, "n1");

        assert!(matches!(
            registry.claim_target("sch-2", "n1").await,
            Err(CoordinatorError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.claim_target("sch-1", "n9").await,
            Err(CoordinatorError::NodeNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let registry = registry().await;
        registry.register(Some("sch-1"), "default").await.unwrap();
        registry.heartbeat("sch-1", &[snapshot("n1")]).await.unwrap();

        registry.mark_disconnected("sch-1").await.unwrap();
        assert!(!registry.is_scheduler_alive("sch-1", Utc::now()).await.unwrap());
        let views = registry.list().await.unwrap();
        assert!(!views[0].alive);
        assert_eq!(views[0].nodes[0].status, NodeStatus::Unreachable);

        registry.heartbeat("sch-1", &[snapshot("n1")]).await.unwrap();
        assert!(registry.is_scheduler_alive("sch-1", Utc::now()).await.unwrap());
        let views = registry.list().await.unwrap();
        assert_eq!(views[0].nodes[0].status, NodeStatus::Healthy);

        assert!(!registry.is_scheduler_alive("ghost", Utc::now()).await.unwrap());
    }
}
