//! S3 object store using the rust-s3 crate.
//!
//! Works against AWS S3 and S3-compatible services such as MinIO. When a
//! custom endpoint is configured, path-style addressing is used.

use super::{ObjectBody, ObjectStore, StoreError, StoreResult, UploadResult, check_expiry};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use s3::{Bucket, BucketConfiguration, creds::Credentials, error::S3Error, region::Region};
use std::{io, time::Duration};
use tokio::io::AsyncRead;
use tracing::{debug, info};

/// S3 caps presigned URLs at seven days.
const MAX_PRESIGN_SECS: u64 = 604_800;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint URL (MinIO and friends).
    pub endpoint: Option<String>,
    /// Optional key prefix applied to every object.
    pub prefix: Option<String>,
    /// Explicit credentials; the default AWS chain is used when absent.
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
            prefix: None,
            access_key: None,
            secret_key: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self
    }

    fn region(&self) -> StoreResult<Region> {
        match &self.endpoint {
            Some(endpoint) => Ok(Region::Custom {
                region: self.region.clone(),
                endpoint: endpoint.clone(),
            }),
            None => self
                .region
                .parse()
                .map_err(|err| StoreError::transport("configure", &self.bucket, err)),
        }
    }

    fn credentials(&self) -> StoreResult<Credentials> {
        let creds = match (&self.access_key, &self.secret_key) {
            (Some(ak), Some(sk)) => {
                Credentials::new(Some(ak.as_str()), Some(sk.as_str()), None, None, None)
            }
            _ => Credentials::default(),
        };
        creds.map_err(|err| StoreError::transport("configure", &self.bucket, err))
    }
}

pub struct S3ObjectStore {
    bucket: Box<Bucket>,
    bucket_name: String,
    region: Region,
    credentials: Credentials,
    prefix: Option<String>,
    use_path_style: bool,
}

impl S3ObjectStore {
    pub fn new(config: S3Config) -> StoreResult<Self> {
        let region = config.region()?;
        let credentials = config.credentials()?;
        let use_path_style = config.endpoint.is_some();

        let bucket = Bucket::new(&config.bucket, region.clone(), credentials.clone())
            .map_err(|err| StoreError::transport("configure", &config.bucket, err))?;
        let bucket = if use_path_style {
            bucket.with_path_style()
        } else {
            bucket
        };

        info!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint,
            path_style = use_path_style,
            "S3 object store configured"
        );

        Ok(Self {
            bucket,
            bucket_name: config.bucket,
            region,
            credentials,
            prefix: config.prefix,
            use_path_style,
        })
    }

    /// Full S3 key with the optional prefix.
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }
}

/// Only a 404 status or an S3 `NoSuchKey` error body count as missing.
fn is_not_found(err: &S3Error) -> bool {
    match err {
        S3Error::HttpFailWithBody(404, _) => true,
        S3Error::HttpFailWithBody(_, body) => body.contains("<Code>NoSuchKey</Code>"),
        _ => false,
    }
}

fn is_already_owned(err: &S3Error) -> bool {
    let msg = err.to_string();
    msg.contains("BucketAlreadyOwnedByYou") || msg.contains("BucketAlreadyExists")
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket_name
    }

    async fn ensure_bucket(&self) -> StoreResult<()> {
        if self.bucket_exists().await? {
            debug!(bucket = %self.bucket_name, "bucket already present");
            return Ok(());
        }

        let config = BucketConfiguration::default();
        let created = if self.use_path_style {
            Bucket::create_with_path_style(
                &self.bucket_name,
                self.region.clone(),
                self.credentials.clone(),
                config,
            )
            .await
        } else {
            Bucket::create(
                &self.bucket_name,
                self.region.clone(),
                self.credentials.clone(),
                config,
            )
            .await
        };

        match created {
            Ok(_) => {
                info!(bucket = %self.bucket_name, "created bucket");
                Ok(())
            }
            // Another instance won the race.
            Err(err) if is_already_owned(&err) => Ok(()),
            Err(err) => Err(StoreError::transport("ensure_bucket", &self.bucket_name, err)),
        }
    }

    async fn bucket_exists(&self) -> StoreResult<bool> {
        self.bucket
            .exists()
            .await
            .map_err(|err| StoreError::transport("bucket_exists", &self.bucket_name, err))
    }

    async fn put(
        &self,
        key: &str,
        mut body: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> StoreResult<UploadResult> {
        let full_key = self.full_key(key);

        // Multipart upload; S3 only exposes the object once it completes.
        let response = self
            .bucket
            .put_object_stream_with_content_type(&mut body, &full_key, content_type)
            .await
            .map_err(|err| StoreError::transport("put", key, err))?;

        debug!(key = %key, size = response.uploaded_bytes(), "S3 put object successful");
        Ok(UploadResult {
            bucket: self.bucket_name.clone(),
            object_key: key.to_string(),
            version_id: None,
            size_bytes: response.uploaded_bytes() as u64,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<ObjectBody> {
        let full_key = self.full_key(key);

        let (head, _) = self.bucket.head_object(&full_key).await.map_err(|err| {
            if is_not_found(&err) {
                StoreError::NotFound {
                    key: key.to_string(),
                }
            } else {
                StoreError::transport("get", key, err)
            }
        })?;

        let response = self
            .bucket
            .get_object_stream(&full_key)
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    StoreError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    StoreError::transport("get", key, err)
                }
            })?;

        let stream = response
            .bytes
            .map_err(|err| io::Error::other(err.to_string()))
            .boxed();

        debug!(key = %key, size = ?head.content_length, "S3 get object stream opened");
        Ok(ObjectBody {
            size: head.content_length.unwrap_or(0).max(0) as u64,
            content_type: head.content_type,
            stream,
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let full_key = self.full_key(key);
        match self.bucket.delete_object(&full_key).await {
            Ok(_) => {
                debug!(key = %key, "S3 delete object successful");
                Ok(true)
            }
            Err(err) if is_not_found(&err) => Ok(true),
            Err(err) => Err(StoreError::transport("delete", key, err)),
        }
    }

    async fn presign(&self, key: &str, expires_in: Duration) -> StoreResult<String> {
        let secs = check_expiry(key, expires_in, MAX_PRESIGN_SECS)?;
        let full_key = self.full_key(key);

        let url = self
            .bucket
            .presign_get(&full_key, secs as u32, None)
            .await
            .map_err(|err| StoreError::transport("presign", key, err))?;

        debug!(key = %key, expires_in_secs = secs, "generated S3 presigned URL");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minio() -> S3Config {
        S3Config::new("uploads", "us-east-1")
            .with_endpoint("http://localhost:9000")
            .with_credentials("minioadmin", "minioadmin")
    }

    #[test]
    fn config_builder() {
        let config = minio().with_prefix("tenant-a/");
        assert_eq!(config.bucket, "uploads");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.prefix.as_deref(), Some("tenant-a/"));
        assert_eq!(config.access_key.as_deref(), Some("minioadmin"));
    }

    #[test]
    fn custom_endpoint_uses_custom_region() {
        let region = minio().region().unwrap();
        assert!(matches!(region, Region::Custom { ref endpoint, .. } if endpoint == "http://localhost:9000"));
    }

    #[test]
    fn full_key_applies_prefix() {
        let store = S3ObjectStore::new(minio().with_prefix("tenant-a/")).unwrap();
        assert_eq!(store.full_key("20240101/ab/data.csv"), "tenant-a/20240101/ab/data.csv");

        let store = S3ObjectStore::new(minio()).unwrap();
        assert_eq!(store.full_key("20240101/ab/data.csv"), "20240101/ab/data.csv");
        assert_eq!(store.bucket(), "uploads");
    }

    #[tokio::test]
    async fn presign_is_local_and_checks_expiry() {
        let store = S3ObjectStore::new(minio()).unwrap();
        let url = store
            .presign("20240101/ab/data.csv", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:9000/"));
        assert!(url.contains("/uploads/20240101/ab/data.csv"));
        assert!(url.contains("X-Amz-Signature"));

        assert!(matches!(
            store.presign("k", Duration::ZERO).await,
            Err(StoreError::InvalidExpiry { .. })
        ));
        assert!(matches!(
            store.presign("k", Duration::from_secs(MAX_PRESIGN_SECS + 1)).await,
            Err(StoreError::InvalidExpiry { .. })
        ));
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found(&S3Error::HttpFailWithBody(404, String::new())));
        assert!(!is_not_found(&S3Error::HttpFailWithBody(500, "boom".into())));
        assert!(is_not_found(&S3Error::HttpFailWithBody(
            400,
            "<Error><Code>NoSuchKey</Code></Error>".into()
        )));
        // Status text in an unrelated failure is not a missing object.
        assert!(!is_not_found(&S3Error::HttpFailWithBody(
            500,
            "upstream said 404 Not Found".into()
        )));
        assert!(!is_not_found(&S3Error::HttpFailWithBody(
            503,
            "NoSuchKeyring service unavailable".into()
        )));
    }
}
