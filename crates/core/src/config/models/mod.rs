pub mod api_observability;
pub mod app_config;
pub mod coordination;
pub mod database;
pub mod storage;

pub use api_observability::{ApiConfig, ObservabilityConfig};
pub use app_config::AppConfig;
pub use coordination::{LifecycleConfig, LocksConfig, RegistryConfig};
pub use database::DatabaseConfig;
pub use storage::{BlobBackendKind, BlobStoreConfig, QueueBackend, QueueConfig};
