use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use coordinator_core::{
    config::DatabaseConfig,
    traits::{
        BlobRepository, DecisionRepository, JobRepository, ProgressRepository,
        RegistryRepository, TaskRepository,
    },
    CoordinatorError, CoordinatorResult,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::sqlite::{
    SqliteBlobRepository, SqliteJobRepository, SqliteProgressRepository,
    SqliteRegistryRepository, SqliteTaskRepository,
};

/// Unified database manager
///
/// 持有连接池并负责迁移，同时作为各仓储实现的工厂。
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 按配置建立连接池并执行迁移
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(CoordinatorError::Database)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        // 内存库的数据只存在于单个连接中
        let in_memory = config.url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
                .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(CoordinatorError::Database)?;

        let manager = Self { pool };
        manager.migrate().await?;
        info!("Database ready: {}", config.url);
        Ok(manager)
    }

    /// 单连接内存库，测试使用
    pub async fn in_memory() -> CoordinatorResult<Self> {
        Self::new(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> CoordinatorResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn job_repository(&self) -> Arc<dyn JobRepository> {
        Arc::new(SqliteJobRepository::new(self.pool.clone()))
    }

    pub fn decision_repository(&self) -> Arc<dyn DecisionRepository> {
        Arc::new(SqliteJobRepository::new(self.pool.clone()))
    }

    pub fn task_repository(&self) -> Arc<dyn TaskRepository> {
        Arc::new(SqliteTaskRepository::new(self.pool.clone()))
    }

    pub fn progress_repository(&self) -> Arc<dyn ProgressRepository> {
        Arc::new(SqliteProgressRepository::new(self.pool.clone()))
    }

    pub fn registry_repository(&self) -> Arc<dyn RegistryRepository> {
        Arc::new(SqliteRegistryRepository::new(self.pool.clone()))
    }

    pub fn blob_repository(&self) -> Arc<dyn BlobRepository> {
        Arc::new(SqliteBlobRepository::new(self.pool.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_manager_migrates() {
        let db = DatabaseManager::in_memory().await.unwrap();
        assert!(db.health_check().await.is_ok());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_queue")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);

        db.close().await;
    }

    #[tokio::test]
    async fn test_file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("coordinator.db").display());
        let db = DatabaseManager::new(&DatabaseConfig {
            url,
            ..DatabaseConfig::default()
        })
        .await
        .unwrap();
        assert!(db.health_check().await.is_ok());
        db.close().await;
    }
}
