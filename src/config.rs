use crate::services::file_service::{
    DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_MAX_FILE_SIZE, UploadPolicy,
};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, fmt, str::FromStr, time::Duration};
use tracing::warn;
use uuid::Uuid;

/// Which object store backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    S3,
    Local,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" | "minio" => Ok(Self::S3),
            "local" | "disk" => Ok(Self::Local),
            other => bail!("unknown storage backend `{}` (expected s3 or local)", other),
        }
    }
}

/// S3 / MinIO connection settings.
#[derive(Clone)]
pub struct S3Settings {
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub prefix: Option<String>,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub backend: StorageBackend,
    pub bucket: String,
    /// Root directory of the local object store.
    pub storage_dir: String,
    /// Where multipart uploads are buffered before ingestion.
    pub spool_dir: String,
    /// Externally reachable base URL; local presigned URLs point here.
    pub public_url: String,
    /// Key for locally signed URLs. Unset means a per-process random key.
    pub signing_secret: Option<String>,
    pub s3: S3Settings,
    pub max_file_size: u64,
    pub allowed_extensions: Vec<String>,
    pub default_url_expiry: Duration,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("backend", &self.backend)
            .field("bucket", &self.bucket)
            .field("storage_dir", &self.storage_dir)
            .field("spool_dir", &self.spool_dir)
            .field("public_url", &self.public_url)
            .field("s3_region", &self.s3.region)
            .field("s3_endpoint", &self.s3.endpoint)
            .field("s3_prefix", &self.s3.prefix)
            .field("max_file_size", &self.max_file_size)
            .field("allowed_extensions", &self.allowed_extensions)
            .field("default_url_expiry", &self.default_url_expiry)
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Content-addressed file ingestion service")]
pub struct Args {
    /// Host to bind to (overrides FILE_SERVICE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_SERVICE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides FILE_SERVICE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object store backend (overrides FILE_SERVICE_STORAGE_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<StorageBackend>,

    /// Bucket name (overrides S3_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Directory for the local backend (overrides FILE_SERVICE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory for buffered uploads (overrides FILE_SERVICE_SPOOL_DIR)
    #[arg(long)]
    pub spool_dir: Option<String>,

    /// S3 endpoint, e.g. http://localhost:9000 for MinIO (overrides S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Maximum upload size in bytes (overrides FILE_SERVICE_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI arguments over values from `lookup`, then defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let parsed = |name: &str| -> Result<Option<u64>> {
            var(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .with_context(|| format!("parsing {} value `{}`", name, value))
                })
                .transpose()
        };

        let port = match (args.port, var("FILE_SERVICE_PORT")) {
            (Some(port), _) => port,
            (None, Some(value)) => value
                .parse::<u16>()
                .with_context(|| format!("parsing FILE_SERVICE_PORT value `{}`", value))?,
            (None, None) => 3000,
        };

        let backend = match (args.backend, var("FILE_SERVICE_STORAGE_BACKEND")) {
            (Some(backend), _) => backend,
            (None, Some(value)) => value
                .parse()
                .context("reading FILE_SERVICE_STORAGE_BACKEND")?,
            (None, None) => StorageBackend::Local,
        };

        let max_file_size = match args.max_file_size {
            Some(size) => size,
            None => parsed("FILE_SERVICE_MAX_FILE_SIZE")?.unwrap_or(DEFAULT_MAX_FILE_SIZE),
        };

        let allowed_extensions = match var("FILE_SERVICE_ALLOWED_EXTENSIONS") {
            Some(list) => list
                .split(',')
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            None => DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        };

        let expiry_secs = parsed("FILE_SERVICE_URL_EXPIRY")?.unwrap_or(3600);
        if expiry_secs == 0 {
            bail!("FILE_SERVICE_URL_EXPIRY must be at least one second");
        }

        let host = args
            .host
            .or_else(|| var("FILE_SERVICE_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let public_url = var("FILE_SERVICE_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", port));

        let cfg = Self {
            database_url: args
                .database_url
                .or_else(|| var("FILE_SERVICE_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/file_service.db".into()),
            backend,
            bucket: args
                .bucket
                .or_else(|| var("S3_BUCKET"))
                .unwrap_or_else(|| "uploads".into()),
            storage_dir: args
                .storage_dir
                .or_else(|| var("FILE_SERVICE_STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            spool_dir: args
                .spool_dir
                .or_else(|| var("FILE_SERVICE_SPOOL_DIR"))
                .unwrap_or_else(|| "./data/spool".into()),
            public_url,
            signing_secret: var("FILE_SERVICE_SIGNING_SECRET").filter(|s| !s.is_empty()),
            s3: S3Settings {
                region: var("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
                endpoint: args.s3_endpoint.or_else(|| var("S3_ENDPOINT")),
                access_key: var("S3_ACCESS_KEY"),
                secret_key: var("S3_SECRET_KEY"),
                prefix: var("S3_PREFIX"),
            },
            max_file_size,
            allowed_extensions,
            default_url_expiry: Duration::from_secs(expiry_secs),
            host,
            port,
        };

        if cfg.allowed_extensions.is_empty() {
            bail!("FILE_SERVICE_ALLOWED_EXTENSIONS must list at least one extension");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy::new(self.max_file_size, &self.allowed_extensions)
    }

    /// The configured URL signing key, or a random one when none is set.
    /// A random key invalidates every signed URL on restart.
    pub fn signing_secret_or_ephemeral(&self) -> String {
        match &self.signing_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!(
                    "FILE_SERVICE_SIGNING_SECRET is not set; signing local URLs with a random per-process key"
                );
                format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(args: Args, vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::resolve(args, |name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = resolve(Args::default(), &[]).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.backend, StorageBackend::Local);
        assert_eq!(cfg.bucket, "uploads");
        assert_eq!(cfg.max_file_size, 800 * 1024 * 1024);
        assert_eq!(cfg.allowed_extensions, vec!["xls", "xlsx", "csv"]);
        assert_eq!(cfg.default_url_expiry, Duration::from_secs(3600));
        assert_eq!(cfg.public_url, "http://127.0.0.1:3000");
        assert!(cfg.signing_secret.is_none());
    }

    #[test]
    fn signing_secret_has_no_shared_default() {
        let cfg = resolve(Args::default(), &[("FILE_SERVICE_SIGNING_SECRET", "")]).unwrap();
        assert!(cfg.signing_secret.is_none());
        let first = cfg.signing_secret_or_ephemeral();
        let second = cfg.signing_secret_or_ephemeral();
        assert_eq!(first.len(), 64);
        assert_ne!(first, second);

        let cfg = resolve(Args::default(), &[("FILE_SERVICE_SIGNING_SECRET", "s3cr3t")]).unwrap();
        assert_eq!(cfg.signing_secret_or_ephemeral(), "s3cr3t");
    }

    #[test]
    fn env_then_args() {
        let vars = [
            ("FILE_SERVICE_PORT", "8080"),
            ("FILE_SERVICE_STORAGE_BACKEND", "minio"),
            ("S3_BUCKET", "tpm-studio"),
            ("S3_ENDPOINT", "http://localhost:9000"),
            ("FILE_SERVICE_ALLOWED_EXTENSIONS", ".CSV, json,"),
            ("FILE_SERVICE_MAX_FILE_SIZE", "1024"),
        ];
        let cfg = resolve(Args::default(), &vars).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.backend, StorageBackend::S3);
        assert_eq!(cfg.bucket, "tpm-studio");
        assert_eq!(cfg.s3.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(cfg.allowed_extensions, vec!["csv", "json"]);
        assert_eq!(cfg.upload_policy().max_size_bytes, 1024);

        let args = Args::try_parse_from([
            "file-service",
            "--port",
            "9000",
            "--backend",
            "local",
            "--max-file-size",
            "10",
            "--migrate",
        ])
        .unwrap();
        assert!(args.migrate);
        let cfg = resolve(args, &vars).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.backend, StorageBackend::Local);
        assert_eq!(cfg.max_file_size, 10);
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = resolve(Args::default(), &[("FILE_SERVICE_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("FILE_SERVICE_PORT"));

        assert!(resolve(Args::default(), &[("FILE_SERVICE_STORAGE_BACKEND", "ftp")]).is_err());
        assert!(resolve(Args::default(), &[("FILE_SERVICE_URL_EXPIRY", "0")]).is_err());
        assert!(resolve(Args::default(), &[("FILE_SERVICE_ALLOWED_EXTENSIONS", " , ")]).is_err());
    }

    #[test]
    fn debug_hides_secrets() {
        let cfg = resolve(
            Args::default(),
            &[("S3_SECRET_KEY", "hunter2"), ("FILE_SERVICE_SIGNING_SECRET", "s3cr3t")],
        )
        .unwrap();
        let printed = format!("{:?}", cfg);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("s3cr3t"));
    }
}
