//! On-disk object store for development and single-node deployments.
//!
//! Payloads live under `base_path/{bucket}/{shard}/{shard}/{key}`. Uploads are
//! written to a temporary file, fsynced, then renamed into place, so readers
//! never observe a partially written object.

use super::{ObjectBody, ObjectStore, StoreError, StoreResult, UploadResult, check_expiry};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_PRESIGN_SECS: u64 = 7 * 24 * 60 * 60;

type HmacSha256 = Hmac<Sha256>;

/// Route under which signed local URLs are served.
pub const SIGNED_OBJECT_ROUTE: [&str; 4] = ["api", "v1", "files", "objects"];

pub struct LocalObjectStore {
    base_path: PathBuf,
    bucket: String,
    public_url: Url,
    signing_secret: Vec<u8>,
}

impl LocalObjectStore {
    /// `public_url` is the externally reachable base of this service; signed
    /// URLs point back at it.
    pub fn new(
        base_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
        public_url: Url,
        signing_secret: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            bucket: bucket.into(),
            public_url,
            signing_secret: signing_secret.as_ref().to_vec(),
        }
    }

    /// Rejects keys that could resolve outside the bucket directory.
    fn ensure_key_safe(key: &str) -> StoreResult<()> {
        let unsafe_key = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
            || key.bytes().any(|b| b.is_ascii_control() || b == b'\\');
        if unsafe_key {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Two-level shard directories from MD5(bucket/key), `00`–`ff` each.
    fn object_shards(&self, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", self.bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = self.object_shards(key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// HMAC-SHA256 over `{bucket}/{key}/{expires}`.
    fn mac(&self, key: &str, expires: i64) -> StoreResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_secret)
            .map_err(|e| StoreError::transport("sign", key, format!("invalid signing key: {}", e)))?;
        mac.update(format!("{}/{}/{}", self.bucket, key, expires).as_bytes());
        Ok(mac)
    }

    fn sign(&self, key: &str, expires: i64) -> StoreResult<String> {
        let mac = self.mac(key, expires)?;
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    /// Remove empty directories from `start` up to, not including, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_bucket(&self) -> StoreResult<()> {
        let root = self.bucket_root();
        fs::create_dir_all(&root)
            .await
            .map_err(|err| StoreError::transport("ensure_bucket", &self.bucket, err))?;
        debug!(bucket = %self.bucket, path = %root.display(), "local bucket ready");
        Ok(())
    }

    async fn bucket_exists(&self) -> StoreResult<bool> {
        match fs::metadata(self.bucket_root()).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::transport("bucket_exists", &self.bucket, err)),
        }
    }

    async fn put(
        &self,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        _content_type: &str,
    ) -> StoreResult<UploadResult> {
        Self::ensure_key_safe(key)?;
        let fail = |err: io::Error| StoreError::transport("put", key, err);

        let file_path = self.object_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| fail(io::Error::other("object path missing parent directory")))?;
        fs::create_dir_all(&parent).await.map_err(fail)?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await.map_err(fail)?;

        let written = async {
            let written = tokio::io::copy(body, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>(written)
        }
        .await;
        drop(file);

        let size_bytes = match written {
            Ok(n) => n,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(fail(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(fail(err));
        }

        debug!(key = %key, size = size_bytes, "local put object successful");
        Ok(UploadResult {
            bucket: self.bucket.clone(),
            object_key: key.to_string(),
            version_id: None,
            size_bytes,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<ObjectBody> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound {
                    key: key.to_string(),
                }
            } else {
                StoreError::transport("get", key, err)
            }
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|err| StoreError::transport("get", key, err))?
            .len();

        Ok(ObjectBody {
            size,
            content_type: None,
            stream: ReaderStream::new(file).boxed(),
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        if Self::ensure_key_safe(key).is_err() {
            // Nothing can live under an unsafe key.
            return Ok(true);
        }
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::transport("delete", key, err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root()).await;
        }
        Ok(true)
    }

    async fn presign(&self, key: &str, expires_in: Duration) -> StoreResult<String> {
        let secs = check_expiry(key, expires_in, MAX_PRESIGN_SECS)?;
        let expires = Utc::now().timestamp() + secs as i64;
        let token = self.sign(key, expires)?;

        let mut url = self.public_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Unsupported {
                operation: "presign with a non-hierarchical public url",
            })?
            .pop_if_empty()
            .extend(SIGNED_OBJECT_ROUTE)
            .extend(key.split('/'));
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("token", &token);

        Ok(url.into())
    }

    fn verify_presigned(&self, key: &str, expires: i64, token: &str) -> StoreResult<()> {
        let rejected = || StoreError::InvalidSignature {
            key: key.to_string(),
        };
        if Utc::now().timestamp() > expires {
            return Err(rejected());
        }
        let signature = URL_SAFE_NO_PAD.decode(token).map_err(|_| rejected())?;
        // verify_slice compares in constant time
        self.mac(key, expires)?
            .verify_slice(&signature)
            .map_err(|_| rejected())
    }
}
