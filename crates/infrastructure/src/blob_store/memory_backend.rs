use std::collections::HashMap;

use async_trait::async_trait;
use coordinator_core::{traits::BlobBackend, CoordinatorError, CoordinatorResult};
use tokio::sync::RwLock;

/// 内存后端，进程退出后内容丢失
#[derive(Default)]
pub struct MemoryBlobBackend {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    staged: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn stage(&self, content: &[u8]) -> CoordinatorResult<String> {
        let staged = uuid::Uuid::new_v4().simple().to_string();
        self.staged
            .write()
            .await
            .insert(staged.clone(), content.to_vec());
        Ok(staged)
    }

    async fn commit(&self, staged: &str, digest: &str) -> CoordinatorResult<String> {
        let content = self.staged.write().await.remove(staged).ok_or_else(|| {
            CoordinatorError::InvariantViolation(format!("暂存内容不存在: {staged}"))
        })?;
        self.blobs
            .write()
            .await
            .entry(digest.to_string())
            .or_insert(content);
        Ok(digest.to_string())
    }

    async fn discard(&self, staged: &str) -> CoordinatorResult<()> {
        self.staged.write().await.remove(staged);
        Ok(())
    }

    async fn read(&self, location: &str) -> CoordinatorResult<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| CoordinatorError::BlobNotFound {
                digest: location.to_string(),
            })
    }

    async fn delete(&self, location: &str) -> CoordinatorResult<()> {
        self.blobs.write().await.remove(location);
        Ok(())
    }
}
