//! # coordinator-core
//!
//! 验证作业协调器的核心类型：错误分类、领域模型、存储与队列接口、
//! 并发守卫、配置和日志初始化。具体的存储实现位于 `coordinator-infrastructure`，
//! 业务流程位于 `coordinator-dispatcher`。

pub mod config;
pub mod errors;
pub mod guard;
pub mod logging;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use errors::{CoordinatorError, CoordinatorResult};
pub use guard::{LockDiagnostic, LockGuard, LockKey, LockManager, LockManagerConfig};
pub use logging::init_logging;
