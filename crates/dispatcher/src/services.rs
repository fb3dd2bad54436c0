use std::sync::Arc;

use coordinator_core::{
    config::BlobBackendKind,
    traits::{BlobStore, TaskQueue},
    AppConfig, CoordinatorResult, LockManager,
};
use coordinator_infrastructure::{ContentAddressedBlobStore, DatabaseManager, TaskQueueFactory};
use tracing::info;

use crate::decision_service::DecisionService;
use crate::lifecycle::{LifecycleComponents, TaskLifecycleManager};
use crate::progress::ProgressAggregator;
use crate::registry::SchedulerRegistry;
use crate::scheduler_liveness::SchedulerLivenessMonitor;
use crate::stuck_task_sweeper::{StuckTaskSweeper, StuckTaskSweeperConfig};

/// 协调器服务集合
///
/// 按配置装配存储、队列、Blob 存储和全部业务服务。
/// 所有服务共享同一个 [`LockManager`]。
#[derive(Clone)]
pub struct CoordinatorServices {
    pub database: DatabaseManager,
    pub locks: LockManager,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub registry: Arc<SchedulerRegistry>,
    pub progress: Arc<ProgressAggregator>,
    pub lifecycle: Arc<TaskLifecycleManager>,
    pub decisions: Arc<DecisionService>,
    pub sweeper: Arc<StuckTaskSweeper>,
    pub liveness: Arc<SchedulerLivenessMonitor>,
}

impl CoordinatorServices {
    pub fn build(config: &AppConfig, database: DatabaseManager) -> Self {
        let locks = LockManager::new(config.locks.to_manager_config());
        let blobs: Arc<dyn BlobStore> = Arc::new(ContentAddressedBlobStore::from_config(
            &config.blob_store,
            database.blob_repository(),
            locks.clone(),
        ));
        let queue = TaskQueueFactory::create(&config.queue, database.pool());
        let registry = Arc::new(SchedulerRegistry::new(
            database.registry_repository(),
            config.registry.clone(),
        ));
        let progress = Arc::new(ProgressAggregator::new(database.progress_repository()));

        let lifecycle = Arc::new(TaskLifecycleManager::new(
            LifecycleComponents {
                tasks: database.task_repository(),
                decisions: database.decision_repository(),
                jobs: database.job_repository(),
                queue: queue.clone(),
                registry: registry.clone(),
                blobs: blobs.clone(),
                progress: progress.clone(),
                locks: locks.clone(),
            },
            Some(config.lifecycle.clone()),
        ));
        let decisions = Arc::new(DecisionService::new(
            database.job_repository(),
            database.decision_repository(),
            database.task_repository(),
            blobs.clone(),
            lifecycle.clone(),
            locks.clone(),
        ));
        let sweeper = Arc::new(StuckTaskSweeper::new(
            database.task_repository(),
            registry.clone(),
            lifecycle.clone(),
            locks.clone(),
            Some(StuckTaskSweeperConfig::from(&config.lifecycle)),
        ));
        let liveness = Arc::new(SchedulerLivenessMonitor::new(
            registry.clone(),
            Some(config.registry.clone()),
        ));

        info!("协调器服务装配完成");
        Self {
            database,
            locks,
            blobs,
            queue,
            registry,
            progress,
            lifecycle,
            decisions,
            sweeper,
            liveness,
        }
    }

    /// 内存数据库与内存 Blob 后端，测试和演示使用
    pub async fn in_memory(mut config: AppConfig) -> CoordinatorResult<Self> {
        config.blob_store.backend = BlobBackendKind::Memory;
        let database = DatabaseManager::in_memory().await?;
        Ok(Self::build(&config, database))
    }
}
