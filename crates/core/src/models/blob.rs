use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 内容寻址的 Blob 元数据
///
/// 摘要是内容的 SHA-256（64位小写十六进制），相同内容只保存一份，
/// `ref_count` 归零时才物理删除。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobInfo {
    pub digest: String,
    pub size: u64,
    pub location: String,
    pub ref_count: i64,
    pub created_at: DateTime<Utc>,
}

/// 计算内容摘要
pub fn compute_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// 校验摘要格式，防止任意字符串进入存储路径
pub fn is_valid_digest(digest: &str) -> bool {
    digest.len() == 64
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
