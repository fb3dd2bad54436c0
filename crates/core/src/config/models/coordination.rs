use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::guard::LockManagerConfig;

/// 任务生命周期配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// 瞬时失败的最大重试次数
    pub max_retries: i32,
    /// 任务未指定队列时使用的队列名
    pub default_queue: String,
    /// 领取后超过该时长且调度器失联的任务被视为卡住
    pub stuck_task_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_queue: "default".to_string(),
            stuck_task_timeout_seconds: 600,
            sweep_interval_seconds: 60,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_retries < 0 {
            return Err(anyhow::anyhow!("最大重试次数不能为负数"));
        }
        if self.default_queue.trim().is_empty() {
            return Err(anyhow::anyhow!("默认队列名不能为空"));
        }
        if self.stuck_task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("卡住任务超时时间必须大于0"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("扫描间隔必须大于0"));
        }
        Ok(())
    }
}

/// 调度器注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_timeout_seconds: u64,
    pub liveness_check_interval_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 90,
            liveness_check_interval_seconds: 30,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("心跳超时时间必须大于0"));
        }
        if self.liveness_check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("存活检查间隔必须大于0"));
        }
        Ok(())
    }
}

/// 并发守卫配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    pub acquire_timeout_ms: u64,
    pub safety_timeout_ms: u64,
    /// 是否强制释放超过安全时限的锁（默认只报告超时）
    pub force_release: bool,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5000,
            safety_timeout_ms: 10000,
            force_release: false,
        }
    }
}

impl LocksConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.acquire_timeout_ms == 0 {
            return Err(anyhow::anyhow!("获取锁超时时间必须大于0"));
        }
        if self.safety_timeout_ms < self.acquire_timeout_ms {
            return Err(anyhow::anyhow!("锁安全时限不能小于获取超时时间"));
        }
        Ok(())
    }

    pub fn to_manager_config(&self) -> LockManagerConfig {
        LockManagerConfig {
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            safety_timeout: Duration::from_millis(self.safety_timeout_ms),
            force_release: self.force_release,
        }
    }
}
