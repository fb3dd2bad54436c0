use std::sync::Arc;

use coordinator_core::{
    config::{QueueBackend, QueueConfig},
    traits::TaskQueue,
};
use sqlx::SqlitePool;
use tracing::info;

use crate::{InMemoryTaskQueue, SqliteTaskQueue};

pub struct TaskQueueFactory;

impl TaskQueueFactory {
    pub fn create(config: &QueueConfig, pool: &SqlitePool) -> Arc<dyn TaskQueue> {
        match config.backend {
            QueueBackend::Sqlite => {
                info!("Initializing SQLite task queue");
                Arc::new(SqliteTaskQueue::new(pool.clone()))
            }
            QueueBackend::Memory => {
                info!("Initializing in-memory task queue");
                Arc::new(InMemoryTaskQueue::new())
            }
        }
    }
}
