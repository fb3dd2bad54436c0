//! 内容寻址 Blob 存储
//!
//! 元数据（大小、位置、引用计数）保存在 `blobs` 表中，内容交给 [`BlobBackend`]。
//! 同一摘要上的所有元数据修改都在 `blob:<摘要>` 锁内完成，
//! 并发的 `put` 各自得到一次引用，不会丢失更新。内容在锁外暂存，
//! 大文件上传不会阻塞同一摘要上的 `retain`/`release`。
//!
//! 引用归零时先删除元数据行再删除内容，内容删除失败只会留下无人引用的文件。

pub mod fs_backend;
pub mod memory_backend;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use coordinator_core::{
    config::{BlobBackendKind, BlobStoreConfig},
    models::{compute_digest, is_valid_digest, BlobInfo},
    traits::{BlobBackend, BlobRepository, BlobStore},
    CoordinatorError, CoordinatorResult, LockKey, LockManager,
};
use tracing::{debug, error, info, warn};

pub use fs_backend::FsBlobBackend;
pub use memory_backend::MemoryBlobBackend;

/// 引用计数的内容寻址存储
pub struct ContentAddressedBlobStore {
    repository: Arc<dyn BlobRepository>,
    backend: Arc<dyn BlobBackend>,
    locks: LockManager,
}

impl ContentAddressedBlobStore {
    pub fn new(
        repository: Arc<dyn BlobRepository>,
        backend: Arc<dyn BlobBackend>,
        locks: LockManager,
    ) -> Self {
        Self {
            repository,
            backend,
            locks,
        }
    }

    /// 按配置选择后端
    pub fn from_config(
        config: &BlobStoreConfig,
        repository: Arc<dyn BlobRepository>,
        locks: LockManager,
    ) -> Self {
        let backend: Arc<dyn BlobBackend> = match config.backend {
            BlobBackendKind::Filesystem => Arc::new(FsBlobBackend::new(&config.root)),
            BlobBackendKind::Memory => Arc::new(MemoryBlobBackend::new()),
        };
        info!("Initializing {} blob store", backend.name());
        Self::new(repository, backend, locks)
    }

    /// 已存在时在锁内增加引用，返回是否命中
    async fn try_deduplicate(&self, digest: &str) -> CoordinatorResult<bool> {
        let _guard = self
            .locks
            .acquire(&[LockKey::blob(digest)], "blob-put")
            .await?;
        match self.repository.increment_ref(digest).await? {
            Some(ref_count) => {
                debug!(digest = %digest, ref_count, "Blob已存在，增加引用");
                metrics::counter!("coordinator_blob_puts_total", "outcome" => "deduplicated")
                    .increment(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn discard_staged(&self, digest: &str, staged: &str) {
        if let Err(e) = self.backend.discard(staged).await {
            warn!(digest = %digest, "清理暂存内容失败: {e}");
        }
    }

    fn check_digest(digest: &str) -> CoordinatorResult<()> {
        if is_valid_digest(digest) {
            Ok(())
        } else {
            Err(CoordinatorError::BlobNotFound {
                digest: digest.to_string(),
            })
        }
    }
}

#[async_trait]
impl BlobStore for ContentAddressedBlobStore {
    async fn put(&self, content: &[u8]) -> CoordinatorResult<String> {
        let digest = compute_digest(content);
        if self.try_deduplicate(&digest).await? {
            return Ok(digest);
        }

        // 字节在锁外写出，锁内只做提交
        let staged = self.backend.stage(content).await?;
        let _guard = self
            .locks
            .acquire(&[LockKey::blob(&digest)], "blob-put")
            .await?;

        if let Some(ref_count) = self.repository.increment_ref(&digest).await? {
            debug!(digest = %digest, ref_count, "暂存期间Blob已被存入，增加引用");
            metrics::counter!("coordinator_blob_puts_total", "outcome" => "deduplicated")
                .increment(1);
            self.discard_staged(&digest, &staged).await;
            return Ok(digest);
        }

        let location = match self.backend.commit(&staged, &digest).await {
            Ok(location) => location,
            Err(e) => {
                self.discard_staged(&digest, &staged).await;
                return Err(e);
            }
        };
        let blob = BlobInfo {
            digest: digest.clone(),
            size: content.len() as u64,
            location: location.clone(),
            ref_count: 1,
            created_at: Utc::now(),
        };
        if let Err(e) = self.repository.insert_blob(&blob).await {
            error!(digest = %digest, "写入Blob元数据失败，清理已写入的内容: {e}");
            if let Err(cleanup) = self.backend.delete(&location).await {
                error!(digest = %digest, "清理Blob内容失败: {cleanup}");
            }
            return Err(e);
        }

        debug!(digest = %digest, size = blob.size, "存入新Blob");
        metrics::counter!("coordinator_blob_puts_total", "outcome" => "stored").increment(1);
        Ok(digest)
    }

    async fn get(&self, digest: &str) -> CoordinatorResult<Vec<u8>> {
        Self::check_digest(digest)?;
        let blob = self
            .repository
            .get_blob(digest)
            .await?
            .filter(|blob| blob.ref_count > 0)
            .ok_or_else(|| CoordinatorError::BlobNotFound {
                digest: digest.to_string(),
            })?;
        self.backend.read(&blob.location).await
    }

    async fn retain(&self, digest: &str) -> CoordinatorResult<()> {
        Self::check_digest(digest)?;
        let _guard = self
            .locks
            .acquire(&[LockKey::blob(digest)], "blob-retain")
            .await?;

        match self.repository.increment_ref(digest).await? {
            Some(_) => Ok(()),
            None => Err(CoordinatorError::BlobNotFound {
                digest: digest.to_string(),
            }),
        }
    }

    async fn release(&self, digest: &str) -> CoordinatorResult<()> {
        let _guard = self
            .locks
            .acquire(&[LockKey::blob(digest)], "blob-release")
            .await?;

        let remaining = self.repository.decrement_ref(digest).await?.ok_or_else(|| {
            CoordinatorError::InvariantViolation(format!("释放没有引用的Blob: {digest}"))
        })?;
        metrics::counter!("coordinator_blob_releases_total").increment(1);

        if remaining == 0 {
            let blob = self.repository.get_blob(digest).await?;
            // 先删元数据行，内容删除失败只留下孤立文件，下次存入同一内容时复用
            if !self.repository.delete_if_unreferenced(digest).await? {
                return Ok(());
            }
            if let Some(blob) = blob {
                if let Err(e) = self.backend.delete(&blob.location).await {
                    warn!(digest = %digest, location = %blob.location, "删除Blob内容失败，留下孤立文件: {e}");
                    metrics::counter!("coordinator_blob_orphaned_content_total").increment(1);
                    return Ok(());
                }
            }
            debug!(digest = %digest, "Blob引用归零，已删除");
        }
        Ok(())
    }

    async fn info(&self, digest: &str) -> CoordinatorResult<Option<BlobInfo>> {
        if !is_valid_digest(digest) {
            return Ok(None);
        }
        Ok(self
            .repository
            .get_blob(digest)
            .await?
            .filter(|blob| blob.ref_count > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::database::DatabaseManager;
    use coordinator_core::LockManagerConfig;
    use tokio::sync::Semaphore;

    async fn memory_store() -> ContentAddressedBlobStore {
        let db = DatabaseManager::in_memory().await.unwrap();
        ContentAddressedBlobStore::new(
            db.blob_repository(),
            Arc::new(MemoryBlobBackend::new()),
            LockManager::new(LockManagerConfig::default()),
        )
    }

    /// 可以让删除失败、让暂存等待放行的内存后端
    struct ControlledBackend {
        inner: MemoryBlobBackend,
        fail_deletes: AtomicBool,
        stage_permits: Semaphore,
    }

    impl ControlledBackend {
        fn new(stage_permits: usize) -> Self {
            Self {
                inner: MemoryBlobBackend::new(),
                fail_deletes: AtomicBool::new(false),
                stage_permits: Semaphore::new(stage_permits),
            }
        }
    }

    #[async_trait]
    impl BlobBackend for ControlledBackend {
        fn name(&self) -> &'static str {
            "controlled"
        }

        async fn stage(&self, content: &[u8]) -> CoordinatorResult<String> {
            self.stage_permits.acquire().await.unwrap().forget();
            self.inner.stage(content).await
        }

        async fn commit(&self, staged: &str, digest: &str) -> CoordinatorResult<String> {
            self.inner.commit(staged, digest).await
        }

        async fn discard(&self, staged: &str) -> CoordinatorResult<()> {
            self.inner.discard(staged).await
        }

        async fn read(&self, location: &str) -> CoordinatorResult<Vec<u8>> {
            self.inner.read(location).await
        }

        async fn delete(&self, location: &str) -> CoordinatorResult<()> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(CoordinatorError::Io(std::io::Error::other("disk unavailable")));
            }
            self.inner.delete(location).await
        }
    }

    async fn controlled_store(backend: Arc<ControlledBackend>) -> ContentAddressedBlobStore {
        let db = DatabaseManager::in_memory().await.unwrap();
        ContentAddressedBlobStore::new(
            db.blob_repository(),
            backend,
            LockManager::new(LockManagerConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_put_deduplicates() {
        let store = memory_store().await;
        let a = store.put(b"solution").await.unwrap();
        let b = store.put(b"solution").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.info(&a).await.unwrap().unwrap().ref_count, 2);
        assert_eq!(store.get(&a).await.unwrap(), b"solution");
    }

    #[tokio::test]
    async fn test_release_deletes_at_zero() {
        let store = memory_store().await;
        let digest = store.put(b"log").await.unwrap();
        store.release(&digest).await.unwrap();

        assert!(store.info(&digest).await.unwrap().is_none());
        assert!(matches!(
            store.get(&digest).await,
            Err(CoordinatorError::BlobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_over_release_is_invariant_violation() {
        let store = memory_store().await;
        let digest = store.put(b"x").await.unwrap();
        store.release(&digest).await.unwrap();
        assert!(matches!(
            store.release(&digest).await,
            Err(CoordinatorError::InvariantViolation(_))
        ));
        assert!(matches!(
            store.release(&compute_digest(b"never stored")).await,
            Err(CoordinatorError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_retain_requires_existing_blob() {
        let store = memory_store().await;
        assert!(matches!(
            store.retain(&compute_digest(b"missing")).await,
            Err(CoordinatorError::BlobNotFound { .. })
        ));

        let digest = store.put(b"config").await.unwrap();
        store.retain(&digest).await.unwrap();
        assert_eq!(store.info(&digest).await.unwrap().unwrap().ref_count, 2);
    }

    #[tokio::test]
    async fn test_malformed_digest_is_not_found() {
        let store = memory_store().await;
        assert!(matches!(
            store.get("../../etc/passwd").await,
            Err(CoordinatorError::BlobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_content_delete_leaves_no_dangling_metadata() {
        let backend = Arc::new(ControlledBackend::new(16));
        let store = controlled_store(backend.clone()).await;
        let digest = store.put(b"report").await.unwrap();

        backend.fail_deletes.store(true, Ordering::SeqCst);
        store.release(&digest).await.unwrap();

        // 元数据已删除，不会再把摘要当作可读内容交出去
        assert!(store.info(&digest).await.unwrap().is_none());
        assert!(matches!(
            store.get(&digest).await,
            Err(CoordinatorError::BlobNotFound { .. })
        ));
        assert!(matches!(
            store.retain(&digest).await,
            Err(CoordinatorError::BlobNotFound { .. })
        ));

        // 再次存入同一内容复用留下的文件
        backend.fail_deletes.store(false, Ordering::SeqCst);
        assert_eq!(store.put(b"report").await.unwrap(), digest);
        assert_eq!(store.info(&digest).await.unwrap().unwrap().ref_count, 1);
        assert_eq!(store.get(&digest).await.unwrap(), b"report");
    }

    #[tokio::test]
    async fn test_staging_does_not_hold_digest_lock() {
        let backend = Arc::new(ControlledBackend::new(0));
        let store = Arc::new(controlled_store(backend.clone()).await);
        let digest = compute_digest(b"large upload");

        let uploader = {
            let store = store.clone();
            tokio::spawn(async move { store.put(b"large upload").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!uploader.is_finished());

        // 上传卡在暂存阶段时，同一摘要上的操作立即返回
        let retain = tokio::time::timeout(Duration::from_secs(1), store.retain(&digest))
            .await
            .expect("retain blocked behind staging");
        assert!(matches!(retain, Err(CoordinatorError::BlobNotFound { .. })));

        backend.stage_permits.add_permits(1);
        assert_eq!(uploader.await.unwrap().unwrap(), digest);
        assert_eq!(store.info(&digest).await.unwrap().unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_puts_of_new_content_count_every_reference() {
        let backend = Arc::new(ControlledBackend::new(0));
        let store = Arc::new(controlled_store(backend.clone()).await);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.put(b"shared input").await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.stage_permits.add_permits(4);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let digest = compute_digest(b"shared input");
        assert_eq!(store.info(&digest).await.unwrap().unwrap().ref_count, 4);
        assert_eq!(backend.inner.len().await, 1);
    }
}
