//! Metadata persistence for [`FileRecord`]s.
//!
//! The service only needs create, point lookup and delete-by-id, so the trait
//! stays that small. [`SqliteFileRepository`] is the production backend.

use crate::models::file_record::{FileRecord, FileStatus};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Schema applied by `--migrate` and by tests.
pub const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait FileRepository: Send + Sync {
    /// Persist a new record. Visible to readers once this returns.
    async fn insert(&self, record: &FileRecord) -> RepoResult<()>;

    /// Point lookup by id, including soft-deleted rows.
    async fn find(&self, id: Uuid) -> RepoResult<Option<FileRecord>>;

    /// Soft-delete. Returns `false` when no active row matched.
    async fn mark_deleted(&self, id: Uuid) -> RepoResult<bool>;

    /// Active records other than `excluding` that point at the same object.
    async fn count_other_references(
        &self,
        bucket: &str,
        object_key: &str,
        excluding: Uuid,
    ) -> RepoResult<i64>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> RepoResult<()>;
}

#[derive(Clone)]
pub struct SqliteFileRepository {
    db: Arc<SqlitePool>,
}

impl SqliteFileRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Run the embedded schema statement by statement.
    pub async fn migrate(&self) -> RepoResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileRepository for SqliteFileRepository {
    async fn insert(&self, record: &FileRecord) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, filename, content_type, size_bytes, content_hash,
                bucket_name, object_key, version_id, access_type,
                expiration_time, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(&record.filename)
        .bind(&record.content_type)
        .bind(record.size_bytes)
        .bind(&record.content_hash)
        .bind(&record.bucket_name)
        .bind(&record.object_key)
        .bind(&record.version_id)
        .bind(record.access_type)
        .bind(record.expiration_time)
        .bind(record.status)
        .bind(record.created_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> RepoResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(
            "SELECT id, filename, content_type, size_bytes, content_hash, bucket_name,
                    object_key, version_id, access_type, expiration_time, status, created_at
             FROM files WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    async fn mark_deleted(&self, id: Uuid) -> RepoResult<bool> {
        let result = sqlx::query("UPDATE files SET status = ? WHERE id = ? AND status = ?")
            .bind(FileStatus::Deleted)
            .bind(id)
            .bind(FileStatus::Active)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_other_references(
        &self,
        bucket: &str,
        object_key: &str,
        excluding: Uuid,
    ) -> RepoResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM files
             WHERE bucket_name = ? AND object_key = ? AND id != ? AND status = ?",
        )
        .bind(bucket)
        .bind(object_key)
        .bind(excluding)
        .bind(FileStatus::Active)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    async fn ping(&self) -> RepoResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}
