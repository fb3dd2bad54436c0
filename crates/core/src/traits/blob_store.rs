use async_trait::async_trait;

use crate::models::BlobInfo;
use crate::CoordinatorResult;

/// Blob 物理存储后端
///
/// 后端只负责字节的读写，引用计数由 [`BlobStore`] 维护。
///
/// 写入分两步：`stage` 在摘要锁之外写出全部字节，
/// `commit` 在锁内把暂存内容发布到最终位置，只做改名一类的廉价操作。
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// 后端名称
    fn name(&self) -> &'static str;

    /// 写入暂存区，返回暂存标识
    async fn stage(&self, content: &[u8]) -> CoordinatorResult<String>;

    /// 把暂存内容发布为 `digest`，返回存储位置
    ///
    /// 目标位置已有内容时保留原内容并丢弃暂存。
    async fn commit(&self, staged: &str, digest: &str) -> CoordinatorResult<String>;

    /// 丢弃暂存内容；不存在时视为成功
    async fn discard(&self, staged: &str) -> CoordinatorResult<()>;

    async fn read(&self, location: &str) -> CoordinatorResult<Vec<u8>>;

    /// 删除内容；位置不存在时视为成功
    async fn delete(&self, location: &str) -> CoordinatorResult<()>;
}

/// 内容寻址存储接口
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 存入内容并增加一次引用，返回摘要
    async fn put(&self, content: &[u8]) -> CoordinatorResult<String>;

    /// 读取内容，不存在时返回 `BlobNotFound`
    async fn get(&self, digest: &str) -> CoordinatorResult<Vec<u8>>;

    /// 为已存在的 Blob 增加一次引用
    async fn retain(&self, digest: &str) -> CoordinatorResult<()>;

    /// 释放一次引用，归零时物理删除
    ///
    /// 没有对应引用时返回 `InvariantViolation`，计数不会变为负数。
    async fn release(&self, digest: &str) -> CoordinatorResult<()>;

    async fn info(&self, digest: &str) -> CoordinatorResult<Option<BlobInfo>>;
}
