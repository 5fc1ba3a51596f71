//! HTTP handlers. Each one translates a request into a [`FileService`] call
//! and maps the result back through [`crate::errors::AppError`].

pub mod file_handlers;
pub mod health_handlers;

use crate::services::file_service::FileService;
use std::{path::PathBuf, sync::Arc, time::Duration};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub files: FileService,
    /// Directory multipart uploads are buffered in before ingestion.
    pub spool_dir: Arc<PathBuf>,
    /// Lifetime of presigned URLs when the caller does not ask for one.
    pub default_url_expiry: Duration,
}

impl AppState {
    pub fn new(files: FileService, spool_dir: impl Into<PathBuf>, default_url_expiry: Duration) -> Self {
        Self {
            files,
            spool_dir: Arc::new(spool_dir.into()),
            default_url_expiry,
        }
    }
}
