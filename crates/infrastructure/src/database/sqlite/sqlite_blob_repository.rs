use async_trait::async_trait;
use coordinator_core::{
    models::BlobInfo, traits::BlobRepository, CoordinatorError, CoordinatorResult,
};
use sqlx::{Row, SqlitePool};

use crate::database::mapping::MappingHelpers;

/// Blob 元数据仓储
pub struct SqliteBlobRepository {
    pool: SqlitePool,
}

impl SqliteBlobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlobRepository for SqliteBlobRepository {
    async fn get_blob(&self, digest: &str) -> CoordinatorResult<Option<BlobInfo>> {
        let row = sqlx::query(
            "SELECT digest, size, location, ref_count, created_at FROM blobs WHERE digest = $1",
        )
        .bind(digest)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        row.as_ref().map(MappingHelpers::row_to_blob).transpose()
    }

    async fn insert_blob(&self, blob: &BlobInfo) -> CoordinatorResult<()> {
        // 删除中途失败留下的零引用行可以被覆盖
        let result = sqlx::query(
            r#"
            INSERT INTO blobs (digest, size, location, ref_count, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT(digest) DO UPDATE SET
                size = excluded.size,
                location = excluded.location,
                ref_count = excluded.ref_count,
                created_at = excluded.created_at
            WHERE blobs.ref_count = 0
            "#,
        )
        .bind(&blob.digest)
        .bind(i64::try_from(blob.size).unwrap_or(i64::MAX))
        .bind(&blob.location)
        .bind(blob.ref_count)
        .bind(MappingHelpers::to_millis(blob.created_at))
        .execute(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::InvariantViolation(format!(
                "Blob已存在且仍被引用: {}",
                blob.digest
            )));
        }
        Ok(())
    }

    async fn increment_ref(&self, digest: &str) -> CoordinatorResult<Option<i64>> {
        let row = sqlx::query(
            "UPDATE blobs SET ref_count = ref_count + 1 WHERE digest = $1 AND ref_count > 0 RETURNING ref_count",
        )
        .bind(digest)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        row.map(|r| r.try_get::<i64, _>("ref_count"))
            .transpose()
            .map_err(CoordinatorError::Database)
    }

    async fn decrement_ref(&self, digest: &str) -> CoordinatorResult<Option<i64>> {
        let row = sqlx::query(
            "UPDATE blobs SET ref_count = ref_count - 1 WHERE digest = $1 AND ref_count > 0 RETURNING ref_count",
        )
        .bind(digest)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoordinatorError::Database)?;

        row.map(|r| r.try_get::<i64, _>("ref_count"))
            .transpose()
            .map_err(CoordinatorError::Database)
    }

    async fn delete_if_unreferenced(&self, digest: &str) -> CoordinatorResult<bool> {
        let result = sqlx::query("DELETE FROM blobs WHERE digest = $1 AND ref_count = 0")
            .bind(digest)
            .execute(&self.pool)
            .await
            .map_err(CoordinatorError::Database)?;
        Ok(result.rows_affected() == 1)
    }
}
