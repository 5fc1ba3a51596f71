//! Object store backends.
//!
//! Everything that talks to the bucket goes through [`ObjectStore`]; the rest
//! of the service never sees which backend is configured.

pub mod local;
#[cfg(test)]
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{io, time::Duration};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Lazily-read object content.
pub type ObjectStream = BoxStream<'static, io::Result<Bytes>>;

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub bucket: String,
    pub object_key: String,
    pub version_id: Option<String>,
    /// Bytes written to the store.
    pub size_bytes: u64,
}

/// An opened object ready to be streamed out.
pub struct ObjectBody {
    pub size: u64,
    pub content_type: Option<String>,
    pub stream: ObjectStream,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error("object key `{key}` is not allowed")]
    InvalidKey { key: String },
    #[error("presign expiry for `{key}` must be between 1 and {max_secs} seconds")]
    InvalidExpiry { key: String, max_secs: u64 },
    #[error("invalid or expired signature for `{key}`")]
    InvalidSignature { key: String },
    #[error("{operation} is not supported by this backend")]
    Unsupported { operation: &'static str },
    #[error("{operation} `{key}` failed: {source}")]
    Transport {
        operation: &'static str,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    pub fn transport(
        operation: &'static str,
        key: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            operation,
            key: key.into(),
            source: source.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Bucket-oriented object storage.
///
/// Implementations never retry; callers own the retry policy.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the bucket every key is resolved against.
    fn bucket(&self) -> &str;

    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self) -> StoreResult<()>;

    /// Whether the bucket is reachable and present.
    async fn bucket_exists(&self) -> StoreResult<bool>;

    /// Stream `body` into `key`. The object becomes visible only once fully
    /// written.
    async fn put(
        &self,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> StoreResult<UploadResult>;

    /// Open `key` for reading. A missing object is [`StoreError::NotFound`].
    async fn get(&self, key: &str) -> StoreResult<ObjectBody>;

    /// Remove `key`. Returns `true` even when the key did not exist.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Time-limited direct-access URL. Does not check that `key` exists.
    async fn presign(&self, key: &str, expires_in: Duration) -> StoreResult<String>;

    /// Check a signature produced by [`ObjectStore::presign`] for backends
    /// that serve their own signed URLs.
    fn verify_presigned(&self, key: &str, expires: i64, token: &str) -> StoreResult<()> {
        let _ = (key, expires, token);
        Err(StoreError::Unsupported {
            operation: "verify_presigned",
        })
    }
}

/// Reject a zero or over-long presign expiry.
pub(crate) fn check_expiry(key: &str, expires_in: Duration, max_secs: u64) -> StoreResult<u64> {
    let secs = expires_in.as_secs();
    if secs == 0 || secs > max_secs {
        return Err(StoreError::InvalidExpiry {
            key: key.to_string(),
            max_secs,
        });
    }
    Ok(secs)
}
