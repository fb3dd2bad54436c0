use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use coordinator_core::{traits::BlobBackend, CoordinatorError, CoordinatorResult};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// 文件系统后端
///
/// 内容保存在 `root/by-digest/<前两位>/<摘要>`。暂存文件写在 `root/staging/`，
/// 提交时改名到最终位置，读者不会看到写了一半的文件。
pub struct FsBlobBackend {
    root: PathBuf,
}

impl FsBlobBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn location_for(digest: &str) -> String {
        let prefix = digest.get(..2).unwrap_or("00");
        format!("by-digest/{prefix}/{digest}")
    }

    fn resolve(&self, location: &str) -> CoordinatorResult<PathBuf> {
        let relative = Path::new(location);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CoordinatorError::InvariantViolation(format!(
                "非法的Blob存储位置: {location}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobBackend for FsBlobBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn stage(&self, content: &[u8]) -> CoordinatorResult<String> {
        let staged = format!("staging/{}", uuid::Uuid::new_v4().simple());
        let path = self.resolve(&staged)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        Ok(staged)
    }

    async fn commit(&self, staged: &str, digest: &str) -> CoordinatorResult<String> {
        let source = self.resolve(staged)?;
        let location = Self::location_for(digest);
        let path = self.resolve(&location)?;
        if tokio::fs::try_exists(&path).await? {
            self.discard(staged).await?;
            return Ok(location);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &path).await?;

        debug!("Blob committed: {}", digest);
        Ok(location)
    }

    async fn discard(&self, staged: &str) -> CoordinatorResult<()> {
        self.delete(staged).await
    }

    async fn read(&self, location: &str) -> CoordinatorResult<Vec<u8>> {
        let path = self.resolve(location)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn delete(&self, location: &str) -> CoordinatorResult<()> {
        let path = self.resolve(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoordinatorError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_core::models::compute_digest;

    #[tokio::test]
    async fn test_stage_commit_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBlobBackend::new(dir.path());
        let digest = compute_digest(b"config");

        let staged = backend.stage(b"config").await.unwrap();
        let location = backend.commit(&staged, &digest).await.unwrap();
        assert!(location.starts_with(&format!("by-digest/{}", &digest[..2])));
        assert_eq!(backend.read(&location).await.unwrap(), b"config");
        assert!(backend.read(&staged).await.is_err());

        // 相同内容再次提交时保留原文件并清理暂存
        let again = backend.stage(b"config").await.unwrap();
        assert_eq!(backend.commit(&again, &digest).await.unwrap(), location);
        assert!(backend.read(&again).await.is_err());

        backend.delete(&location).await.unwrap();
        assert!(backend.read(&location).await.is_err());
        backend.delete(&location).await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_removes_staged_content() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBlobBackend::new(dir.path());

        let staged = backend.stage(b"abandoned").await.unwrap();
        backend.discard(&staged).await.unwrap();
        assert!(backend.read(&staged).await.is_err());
        backend.discard(&staged).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBlobBackend::new(dir.path());
        assert!(matches!(
            backend.read("../outside").await,
            Err(CoordinatorError::InvariantViolation(_))
        ));
    }
}
