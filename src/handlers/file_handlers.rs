//! HTTP handlers for file upload, download, info, presigned URLs and delete.
//! Bodies are streamed in both directions; uploads are spooled to disk so
//! they can be hashed and then uploaded from the start.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::file_record::{AccessType, FileRecord},
    services::file_service::{FileError, IngestRequest, RemoveOutcome},
    storage::ObjectBody,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State, multipart::Field},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    io::ErrorKind,
    path::{Path as FsPath, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Query params for `GET /info/{id}`.
#[derive(Debug, Deserialize)]
pub struct InfoQuery {
    #[serde(default)]
    pub generate_url: bool,
    pub url_expires: Option<u64>,
}

/// Query params for `GET /url/{id}`.
#[derive(Debug, Deserialize)]
pub struct UrlQuery {
    pub expires: Option<u64>,
}

/// Query params of a locally signed object URL.
#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct FileInfo {
    #[serde(flatten)]
    pub record: FileRecord,
    /// Past `expiration_time`. Informational only; nothing is enforced.
    pub expired: bool,
    pub download_url: Option<String>,
}

/// An upload buffered on disk. The file is removed when dropped.
struct SpooledUpload {
    path: PathBuf,
    file: File,
    size: u64,
}

impl SpooledUpload {
    async fn create(dir: &FsPath) -> Result<Self, AppError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| AppError::internal(format!("failed to prepare spool dir: {}", e)))?;
        let path = dir.join(format!(".upload-{}", Uuid::new_v4()));
        // Read access is needed: the service hashes the spool before uploading it.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| AppError::internal(format!("failed to create spool file: {}", e)))?;
        Ok(Self {
            path,
            file,
            size: 0,
        })
    }
}

impl Drop for SpooledUpload {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove spool file");
            }
        }
    }
}

/// Copy a multipart field to the spool, enforcing the size limit as bytes
/// arrive.
async fn spool_field(
    field: &mut Field<'_>,
    spool: &mut SpooledUpload,
    limit: u64,
) -> Result<(), AppError> {
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| AppError::new(e.status(), e.body_text()))?
    {
        spool.size += chunk.len() as u64;
        if spool.size > limit {
            return Err(FileError::PayloadTooLarge { limit }.into());
        }
        spool
            .file
            .write_all(&chunk)
            .await
            .map_err(|e| AppError::internal(format!("failed to spool upload: {}", e)))?;
    }
    spool
        .file
        .flush()
        .await
        .map_err(|e| AppError::internal(format!("failed to spool upload: {}", e)))?;
    Ok(())
}

/// `POST /api/v1/files/upload`: multipart `file`, optional `access_type`
/// and `expiration_time` (RFC 3339).
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let policy = state.files.policy();
    let mut upload: Option<(SpooledUpload, IngestRequest)> = None;
    let mut access_type = AccessType::default();
    let mut expiration_time: Option<DateTime<Utc>> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::new(e.status(), e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::bad_request("`file` field has no filename"))?;
                // Reject disallowed types before buffering anything.
                policy.check_extension(&filename)?;

                let mut request = IngestRequest::new(filename);
                request.content_type = field.content_type().map(str::to_string);

                let mut spool = SpooledUpload::create(&state.spool_dir).await?;
                spool_field(&mut field, &mut spool, policy.max_size_bytes).await?;
                debug!(filename = %request.filename, size = spool.size, "upload spooled");
                upload = Some((spool, request));
            }
            Some("access_type") => {
                let text = field_text(field).await?;
                if !text.trim().is_empty() {
                    access_type = text
                        .parse::<AccessType>()
                        .map_err(AppError::bad_request)?;
                }
            }
            Some("expiration_time") => {
                let text = field_text(field).await?;
                if !text.trim().is_empty() {
                    let parsed = DateTime::parse_from_rfc3339(text.trim()).map_err(|e| {
                        AppError::bad_request(format!("invalid expiration_time: {}", e))
                    })?;
                    expiration_time = Some(parsed.with_timezone(&Utc));
                }
            }
            _ => {}
        }
    }

    let (mut spool, mut request) =
        upload.ok_or_else(|| AppError::bad_request("missing `file` field"))?;
    request.access_type = access_type;
    request.expiration_time = expiration_time;

    let record = state.files.ingest(&mut spool.file, request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn field_text(field: Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| AppError::new(e.status(), e.body_text()))
}

/// `GET /api/v1/files/info/{id}?generate_url=&url_expires=`
pub async fn file_info(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<InfoQuery>,
) -> Result<Json<FileInfo>, AppError> {
    let presign = q.generate_url.then(|| {
        q.url_expires
            .map(Duration::from_secs)
            .unwrap_or(state.default_url_expiry)
    });
    let (record, download_url) = state.files.describe(id, presign).await?;
    Ok(Json(FileInfo {
        expired: record.is_expired(Utc::now()),
        record,
        download_url,
    }))
}

/// `GET /api/v1/files/download/{id}`: streams the stored object.
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (body, record) = state.files.retrieve(id).await?;
    Ok(stream_response(
        body,
        &record.content_type,
        Some(&record.filename),
    ))
}

/// `GET /api/v1/files/url/{id}?expires=`
pub async fn presigned_url(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<UrlQuery>,
) -> Result<impl IntoResponse, AppError> {
    let expires_in = q
        .expires
        .map(Duration::from_secs)
        .unwrap_or(state.default_url_expiry);
    let url = state.files.presigned_url(id, expires_in).await?;
    Ok(Json(json!({
        "url": url,
        "expires_in": expires_in.as_secs(),
    })))
}

/// `DELETE /api/v1/files/{id}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let body = match state.files.remove(id).await? {
        RemoveOutcome::NotFound => {
            return Err(AppError::not_found(format!("file `{}` not found", id)));
        }
        RemoveOutcome::Removed { .. } => json!({
            "id": id,
            "deleted": true,
            "metadata_orphaned": false,
        }),
        RemoveOutcome::MetadataOrphaned { object_key, error } => json!({
            "id": id,
            "deleted": true,
            "metadata_orphaned": true,
            "object_key": object_key,
            "error": error.to_string(),
        }),
    };
    Ok(Json(body))
}

/// `GET /api/v1/files/health`: object store reachability.
pub async fn storage_health(State(state): State<AppState>) -> impl IntoResponse {
    let bucket = state.files.bucket().to_string();
    match state.files.storage_healthy().await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "bucket": bucket })),
        ),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "bucket": bucket, "error": "bucket does not exist" })),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "bucket": bucket, "error": err.to_string() })),
        ),
    }
}

/// `GET /api/v1/files/objects/{*key}?expires=&token=`: serves URLs signed
/// by the local object store.
pub async fn signed_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<SignedQuery>,
) -> Result<Response, AppError> {
    let body = state.files.open_presigned(&key, q.expires, &q.token).await?;
    let content_type = body
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    let filename = key.rsplit('/').next().map(str::to_string);
    Ok(stream_response(body, &content_type, filename.as_deref()))
}

fn stream_response(body: ObjectBody, content_type: &str, filename: Option<&str>) -> Response {
    let size = body.size;
    let mut response = Response::new(Body::from_stream(body.stream));
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), content_type, size, filename);
    response
}

fn set_file_headers(headers: &mut HeaderMap, content_type: &str, size: u64, filename: Option<&str>) {
    let content_type = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Some(name) = filename {
        if let Ok(value) = HeaderValue::from_str(&content_disposition(name)) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 name.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    if fallback == filename {
        return format!("attachment; filename=\"{}\"", filename);
    }

    let mut encoded = String::with_capacity(filename.len() * 3);
    for byte in filename.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'!' | b'#' | b'$' | b'&' | b'+'
            | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~' => encoded.push(byte as char),
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}
