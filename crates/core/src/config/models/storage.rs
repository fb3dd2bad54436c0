use serde::{Deserialize, Serialize};

/// 任务队列后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// 持久化在数据库中，进程重启后未领取的任务不会丢失
    #[default]
    Sqlite,
    /// 仅用于测试和单进程演示
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
}

/// Blob 存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackendKind {
    #[default]
    Filesystem,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    pub backend: BlobBackendKind,
    /// 文件系统后端的根目录
    pub root: String,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            backend: BlobBackendKind::Filesystem,
            root: "data/blobs".to_string(),
        }
    }
}

impl BlobStoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == BlobBackendKind::Filesystem && self.root.trim().is_empty() {
            return Err(anyhow::anyhow!("文件系统Blob存储的根目录不能为空"));
        }
        Ok(())
    }
}
