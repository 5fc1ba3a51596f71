//! Represents the metadata row kept for every ingested file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Who may read the stored object directly.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum AccessType {
    #[default]
    Private,
    PublicRead,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::PublicRead => write!(f, "public-read"),
        }
    }
}

impl FromStr for AccessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "private" => Ok(Self::Private),
            "public-read" | "public_read" => Ok(Self::PublicRead),
            other => Err(format!(
                "unknown access type `{}` (expected `private` or `public-read`)",
                other
            )),
        }
    }
}

/// Soft-delete flag of a file record.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileStatus {
    #[default]
    Active,
    Deleted,
}

/// Metadata for one uploaded file.
///
/// The row never holds content bytes; it points at the object through
/// `bucket_name`/`object_key`, which are written once at creation.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    /// Internal UUID, assigned at creation.
    pub id: Uuid,

    /// Original client-supplied filename.
    pub filename: String,

    /// Content type (MIME type) as declared by the uploader.
    pub content_type: String,

    /// Number of bytes actually read while hashing the upload.
    pub size_bytes: i64,

    /// Lowercase hex SHA-256 of the full content.
    pub content_hash: String,

    /// Bucket the object lives in.
    pub bucket_name: String,

    /// Key of the object inside `bucket_name`, `{YYYYMMDD}/{hash}/{filename}`.
    pub object_key: String,

    /// Version identifier reported by the store, if any.
    pub version_id: Option<String>,

    pub access_type: AccessType,

    /// After this instant the record is logically expired.
    pub expiration_time: Option<DateTime<Utc>>,

    pub status: FileStatus,

    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// `bucket/key` path of the stored object, mostly useful for logs.
    pub fn storage_path(&self) -> String {
        format!("{}/{}", self.bucket_name, self.object_key)
    }

    pub fn is_active(&self) -> bool {
        self.status == FileStatus::Active
    }

    /// Whether `expiration_time` has passed. Enforcement is left to callers.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|at| at <= now)
    }
}
