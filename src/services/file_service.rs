//! src/services/file_service.rs
//!
//! FileService: ingestion, retrieval and deletion of uploaded files.
//!
//! Content is hashed, stored in the object store under
//! `{YYYYMMDD}/{sha256}/{filename}`, and described by one metadata row per
//! upload. The object is always written before its row and removed before
//! its row is marked deleted, so a visible row never points at an object
//! that was not stored. Work on one object key (put + insert, or reference
//! count + delete + soft delete) runs under a per-key lock, since uploads of
//! the same bytes under the same name on the same day share a key.

use crate::{
    models::file_record::{AccessType, FileRecord, FileStatus},
    services::{
        file_repository::{FileRepository, RepoError},
        hasher::{HashError, digest_seekable},
        keys::{KeyError, derive_key, ensure_filename_safe},
    },
    storage::{ObjectBody, ObjectStore, StoreError},
};
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeSet, HashMap},
    io::{self, SeekFrom},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt},
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 800 * 1024 * 1024;
pub const DEFAULT_ALLOWED_EXTENSIONS: [&str; 3] = ["xls", "xlsx", "csv"];
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file type {} is not allowed", .extension.as_deref().map(|e| format!("`.{e}`")).unwrap_or_else(|| "without extension".into()))]
    UnsupportedType { extension: Option<String> },
    #[error("file exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("file `{id}` references object `{object_key}` which is missing from storage")]
    StorageInconsistency { id: Uuid, object_key: String },
    #[error("object store failure: {0}")]
    StorageTransport(#[source] StoreError),
    #[error("metadata store failure: {0}")]
    MetadataPersistence(#[source] RepoError),
    #[error("object `{object_key}` was stored without metadata and could not be removed: {source}")]
    OrphanedObject {
        object_key: String,
        #[source]
        source: RepoError,
    },
    #[error("signature rejected for `{0}`")]
    SignatureRejected(String),
    #[error("reading the upload failed: {0}")]
    ReadFailed(#[source] io::Error),
    #[error("{0}")]
    InvalidArgument(String),
}

impl From<KeyError> for FileError {
    fn from(err: KeyError) -> Self {
        FileError::InvalidArgument(err.to_string())
    }
}

pub type FileResult<T> = Result<T, FileError>;

/// Limits applied to every upload.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_size_bytes: u64,
    /// Lowercase extensions without the leading dot.
    pub allowed_extensions: BTreeSet<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_SIZE, DEFAULT_ALLOWED_EXTENSIONS)
    }
}

impl UploadPolicy {
    pub fn new<I, S>(max_size_bytes: u64, allowed_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            max_size_bytes,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
        }
    }

    /// Extension after the last `.`, lowercased, if it is allowed.
    pub fn check_extension(&self, filename: &str) -> FileResult<String> {
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .filter(|ext| !ext.is_empty());

        match extension {
            Some(ext) if self.allowed_extensions.contains(&ext) => Ok(ext),
            other => Err(FileError::UnsupportedType { extension: other }),
        }
    }

    pub fn check_size(&self, size: u64) -> FileResult<()> {
        if size > self.max_size_bytes {
            return Err(FileError::PayloadTooLarge {
                limit: self.max_size_bytes,
            });
        }
        Ok(())
    }
}

/// Caller-supplied description of an upload.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub filename: String,
    pub content_type: Option<String>,
    /// Size announced by the client. Only used to reject early; the stored
    /// size is always what was read.
    pub declared_size: Option<u64>,
    pub access_type: AccessType,
    pub expiration_time: Option<DateTime<Utc>>,
}

impl IngestRequest {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }
}

/// Result of [`FileService::remove`].
#[derive(Debug)]
pub enum RemoveOutcome {
    /// No active record with that id.
    NotFound,
    /// Record marked deleted. `object_retained` is set when other active
    /// records still point at the same object, which is then left in place.
    Removed { object_retained: bool },
    /// The object is gone but the record could not be marked deleted.
    MetadataOrphaned { object_key: String, error: RepoError },
}

impl RemoveOutcome {
    /// Whether the file is no longer retrievable.
    pub fn removed(&self) -> bool {
        !matches!(self, RemoveOutcome::NotFound)
    }
}

/// Per-object-key async locks. Entries are dropped once nobody holds or
/// waits on them.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct KeyGuard<'a> {
    owner: &'a KeyLocks,
    key: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.owner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and this guard hold the only references: nobody is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct FileService {
    store: Arc<dyn ObjectStore>,
    repo: Arc<dyn FileRepository>,
    policy: Arc<UploadPolicy>,
    key_locks: Arc<KeyLocks>,
}

impl FileService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        repo: Arc<dyn FileRepository>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            store,
            repo,
            policy: Arc::new(policy),
            key_locks: Arc::new(KeyLocks::default()),
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn bucket(&self) -> &str {
        self.store.bucket()
    }

    /// Create the bucket if needed. Called once at startup.
    pub async fn ensure_bucket(&self) -> FileResult<()> {
        self.store
            .ensure_bucket()
            .await
            .map_err(FileError::StorageTransport)
    }

    /// Whether the configured bucket is reachable.
    pub async fn storage_healthy(&self) -> FileResult<bool> {
        self.store
            .bucket_exists()
            .await
            .map_err(FileError::StorageTransport)
    }

    pub async fn metadata_healthy(&self) -> FileResult<()> {
        self.repo.ping().await.map_err(FileError::MetadataPersistence)
    }

    /// Validate, hash, store and record one upload.
    ///
    /// Validation failures return before any storage I/O. The reader is
    /// read twice (hash, then upload); both passes start at offset 0.
    pub async fn ingest<R>(&self, reader: &mut R, request: IngestRequest) -> FileResult<FileRecord>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let extension = self.policy.check_extension(&request.filename)?;
        ensure_filename_safe(&request.filename)?;
        if let Some(declared) = request.declared_size {
            self.policy.check_size(declared)?;
        }

        let digest = digest_seekable(reader, Some(self.policy.max_size_bytes))
            .await
            .map_err(|err| match err {
                HashError::LimitExceeded { limit } => FileError::PayloadTooLarge { limit },
                HashError::Io(err) => FileError::ReadFailed(err),
            })?;

        let object_key = derive_key(Utc::now().date_naive(), &digest.hex, &request.filename)?;
        let content_type = request
            .content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        debug!(
            filename = %request.filename,
            extension = %extension,
            size = digest.size,
            hash = %digest.hex,
            "upload validated"
        );

        reader
            .seek(SeekFrom::Start(0))
            .await
            .map_err(FileError::ReadFailed)?;
        let _key_guard = self.key_locks.lock(&object_key).await;
        let mut body = reader.take(digest.size);
        let uploaded = self
            .store
            .put(&object_key, &mut body, &content_type)
            .await
            .map_err(FileError::StorageTransport)?;

        if uploaded.size_bytes != digest.size {
            warn!(
                key = %object_key,
                hashed = digest.size,
                uploaded = uploaded.size_bytes,
                "upload stream changed between hashing and upload"
            );
            self.discard_object(&object_key).await;
            return Err(FileError::ReadFailed(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upload stream shrank after hashing",
            )));
        }

        let record = FileRecord {
            id: Uuid::new_v4(),
            filename: request.filename,
            content_type,
            size_bytes: digest.size as i64,
            content_hash: digest.hex,
            bucket_name: uploaded.bucket,
            object_key: uploaded.object_key,
            version_id: uploaded.version_id,
            access_type: request.access_type,
            expiration_time: request.expiration_time,
            status: FileStatus::Active,
            created_at: Utc::now(),
        };

        if let Err(err) = self.repo.insert(&record).await {
            return Err(self.compensate_failed_insert(&record, err).await);
        }

        info!(
            id = %record.id,
            path = %record.storage_path(),
            size = record.size_bytes,
            "file ingested"
        );
        Ok(record)
    }

    /// Open the content of an active file.
    pub async fn retrieve(&self, id: Uuid) -> FileResult<(ObjectBody, FileRecord)> {
        let record = self.active_record(id).await?;
        match self.store.get(&record.object_key).await {
            Ok(body) => Ok((body, record)),
            Err(StoreError::NotFound { .. }) => {
                error!(
                    id = %record.id,
                    path = %record.storage_path(),
                    "metadata points at a missing object"
                );
                Err(FileError::StorageInconsistency {
                    id: record.id,
                    object_key: record.object_key,
                })
            }
            Err(err) => Err(FileError::StorageTransport(err)),
        }
    }

    /// Delete the object, then soft-delete the record.
    pub async fn remove(&self, id: Uuid) -> FileResult<RemoveOutcome> {
        let record = match self.repo.find(id).await {
            Ok(Some(record)) if record.is_active() => record,
            Ok(_) => return Ok(RemoveOutcome::NotFound),
            Err(err) => return Err(FileError::MetadataPersistence(err)),
        };

        let _key_guard = self.key_locks.lock(&record.object_key).await;
        // A concurrent remove of the same id may have finished meanwhile.
        match self.repo.find(id).await {
            Ok(Some(current)) if current.is_active() => {}
            Ok(_) => return Ok(RemoveOutcome::NotFound),
            Err(err) => return Err(FileError::MetadataPersistence(err)),
        }

        let others = self
            .repo
            .count_other_references(&record.bucket_name, &record.object_key, record.id)
            .await
            .map_err(FileError::MetadataPersistence)?;
        let object_retained = others > 0;

        if object_retained {
            debug!(
                id = %record.id,
                references = others,
                "object shared with other records, leaving it in place"
            );
        } else {
            self.store
                .delete(&record.object_key)
                .await
                .map_err(FileError::StorageTransport)?;
        }

        match self.repo.mark_deleted(record.id).await {
            Ok(_) => {
                info!(id = %record.id, path = %record.storage_path(), "file removed");
                Ok(RemoveOutcome::Removed { object_retained })
            }
            Err(err) if object_retained => {
                // Nothing was changed: the object stays and so does the row.
                warn!(
                    id = %record.id,
                    path = %record.storage_path(),
                    error = %err,
                    "failed to mark shared file deleted"
                );
                Err(FileError::MetadataPersistence(err))
            }
            Err(err) => {
                error!(
                    id = %record.id,
                    path = %record.storage_path(),
                    error = %err,
                    "object removed but metadata could not be updated; needs cleanup"
                );
                Ok(RemoveOutcome::MetadataOrphaned {
                    object_key: record.object_key,
                    error: err,
                })
            }
        }
    }

    /// Time-limited direct URL for an active file.
    pub async fn presigned_url(&self, id: Uuid, expires_in: Duration) -> FileResult<String> {
        check_url_expiry(expires_in)?;
        let record = self.active_record(id).await?;
        self.presign_record(&record, expires_in).await
    }

    /// Metadata of an active file, plus a URL when `presign` is set.
    pub async fn describe(
        &self,
        id: Uuid,
        presign: Option<Duration>,
    ) -> FileResult<(FileRecord, Option<String>)> {
        if let Some(expires_in) = presign {
            check_url_expiry(expires_in)?;
        }
        let record = self.active_record(id).await?;
        let url = match presign {
            Some(expires_in) => Some(self.presign_record(&record, expires_in).await?),
            None => None,
        };
        Ok((record, url))
    }

    async fn presign_record(&self, record: &FileRecord, expires_in: Duration) -> FileResult<String> {
        self.store
            .presign(&record.object_key, expires_in)
            .await
            .map_err(|err| match err {
                StoreError::InvalidExpiry { .. } => FileError::InvalidArgument(err.to_string()),
                other => FileError::StorageTransport(other),
            })
    }

    /// Serve an object through a URL produced by a self-signing store.
    pub async fn open_presigned(
        &self,
        key: &str,
        expires: i64,
        token: &str,
    ) -> FileResult<ObjectBody> {
        self.store
            .verify_presigned(key, expires, token)
            .map_err(|err| match err {
                StoreError::Unsupported { .. } => FileError::NotFound(key.to_string()),
                _ => FileError::SignatureRejected(key.to_string()),
            })?;

        self.store.get(key).await.map_err(|err| match err {
            StoreError::NotFound { .. } | StoreError::InvalidKey { .. } => {
                FileError::NotFound(key.to_string())
            }
            other => FileError::StorageTransport(other),
        })
    }

    async fn active_record(&self, id: Uuid) -> FileResult<FileRecord> {
        match self.repo.find(id).await {
            Ok(Some(record)) if record.is_active() => Ok(record),
            Ok(_) => Err(FileError::NotFound(id.to_string())),
            Err(err) => Err(FileError::MetadataPersistence(err)),
        }
    }

    /// Undo the object write after the metadata insert failed.
    async fn compensate_failed_insert(&self, record: &FileRecord, err: RepoError) -> FileError {
        let others = self
            .repo
            .count_other_references(&record.bucket_name, &record.object_key, record.id)
            .await;

        match others {
            Ok(0) => match self.store.delete(&record.object_key).await {
                Ok(_) => {
                    warn!(
                        path = %record.storage_path(),
                        error = %err,
                        "metadata insert failed, stored object removed"
                    );
                    FileError::MetadataPersistence(err)
                }
                Err(delete_err) => {
                    error!(
                        path = %record.storage_path(),
                        error = %err,
                        cleanup_error = %delete_err,
                        "metadata insert failed and object cleanup failed; orphaned object"
                    );
                    FileError::OrphanedObject {
                        object_key: record.object_key.clone(),
                        source: err,
                    }
                }
            },
            // Same bytes under the same name today: the object belongs to
            // another record too.
            Ok(_) => FileError::MetadataPersistence(err),
            Err(count_err) => {
                error!(
                    path = %record.storage_path(),
                    error = %err,
                    lookup_error = %count_err,
                    "metadata insert failed and object ownership is unknown; orphaned object"
                );
                FileError::OrphanedObject {
                    object_key: record.object_key.clone(),
                    source: err,
                }
            }
        }
    }

    async fn discard_object(&self, key: &str) {
        if let Err(err) = self.store.delete(key).await {
            error!(key = %key, error = %err, "failed to discard object");
        }
    }
}

fn check_url_expiry(expires_in: Duration) -> FileResult<()> {
    if expires_in.as_secs() == 0 {
        return Err(FileError::InvalidArgument(
            "url expiry must be at least one second".into(),
        ));
    }
    Ok(())
}
