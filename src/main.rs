use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use url::Url;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod storage;

use config::{AppConfig, StorageBackend};
use handlers::AppState;
use services::{
    file_repository::SqliteFileRepository,
    file_service::FileService,
};
use storage::{
    ObjectStore,
    local::LocalObjectStore,
    s3::{S3Config, S3ObjectStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-service with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let db_path = db_path.split('?').next().unwrap_or(db_path);

    if !db_path.is_empty() && !db_path.starts_with(":memory:") {
        let db_path_obj = Path::new(db_path);

        // Create parent directory if needed
        if let Some(parent) = db_path_obj.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {:?}", parent))?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }

        // SQLx does not create the file by default
        match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path_obj)
        {
            Ok(_) => tracing::debug!("Database file {} is ready.", db_path),
            Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
        }
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );
    let repo = SqliteFileRepository::new(db.clone());

    // --- Handle migration mode ---
    if migrate {
        repo.migrate().await.context("running migrations")?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Object store ---
    let store = build_store(&cfg)?;
    store
        .ensure_bucket()
        .await
        .with_context(|| format!("preparing bucket `{}`", store.bucket()))?;

    // --- Initialize core service ---
    let files = FileService::new(store, Arc::new(repo), cfg.upload_policy());
    let state = AppState::new(files, &cfg.spool_dir, cfg.default_url_expiry);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the configured object store backend.
fn build_store(cfg: &AppConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match cfg.backend {
        StorageBackend::S3 => {
            let mut s3 = S3Config::new(&cfg.bucket, &cfg.s3.region);
            if let Some(endpoint) = &cfg.s3.endpoint {
                s3 = s3.with_endpoint(endpoint);
            }
            if let Some(prefix) = &cfg.s3.prefix {
                s3 = s3.with_prefix(prefix);
            }
            if let (Some(ak), Some(sk)) = (&cfg.s3.access_key, &cfg.s3.secret_key) {
                s3 = s3.with_credentials(ak, sk);
            }
            Arc::new(S3ObjectStore::new(s3).context("configuring S3 object store")?)
        }
        StorageBackend::Local => {
            // --- Ensure storage directory exists ---
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            let public_url = Url::parse(&cfg.public_url)
                .with_context(|| format!("parsing public url `{}`", cfg.public_url))?;
            Arc::new(LocalObjectStore::new(
                &cfg.storage_dir,
                &cfg.bucket,
                public_url,
                cfg.signing_secret_or_ephemeral(),
            ))
        }
    };
    Ok(store)
}
