//! 协调器配置
//!
//! 加载顺序：内置默认值 → TOML 配置文件 → `COORDINATOR_` 前缀的环境变量。
//! 环境变量用 `__` 分隔层级，例如 `COORDINATOR_LIFECYCLE__MAX_RETRIES=5`。

pub mod models;

pub use models::*;
