//! In-memory object store used by the service tests.

use super::{ObjectBody, ObjectStore, StoreError, StoreResult, UploadResult, check_expiry};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::{
    collections::HashMap,
    io,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    pub put_calls: AtomicUsize,
    pub fail_put: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl MemoryObjectStore {
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Drop an object behind the service's back.
    pub fn remove_out_of_band(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        "memory"
    }

    async fn ensure_bucket(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn bucket_exists(&self) -> StoreResult<bool> {
        Ok(true)
    }

    async fn put(
        &self,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> StoreResult<UploadResult> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StoreError::transport(
                "put",
                key,
                io::Error::new(io::ErrorKind::ConnectionRefused, "store offline"),
            ));
        }

        let mut data = Vec::new();
        body.read_to_end(&mut data)
            .await
            .map_err(|err| StoreError::transport("put", key, err))?;
        let size_bytes = data.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (Bytes::from(data), content_type.to_string()));

        Ok(UploadResult {
            bucket: self.bucket().to_string(),
            object_key: key.to_string(),
            version_id: Some("v1".into()),
            size_bytes,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<ObjectBody> {
        let (data, content_type) = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;

        Ok(ObjectBody {
            size: data.len() as u64,
            content_type: Some(content_type),
            stream: stream::iter(vec![Ok::<_, io::Error>(data)]).boxed(),
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StoreError::transport(
                "delete",
                key,
                io::Error::new(io::ErrorKind::TimedOut, "store timed out"),
            ));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(true)
    }

    async fn presign(&self, key: &str, expires_in: Duration) -> StoreResult<String> {
        let secs = check_expiry(key, expires_in, u64::MAX)?;
        Ok(format!("memory://{}?expires={}", key, secs))
    }
}
