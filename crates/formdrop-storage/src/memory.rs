//! In-process storage backend.
//!
//! Selected with `STORAGE_BACKEND=memory`; also the backend used by the
//! transfer and worker test suites.

use crate::traits::{validate_key, ByteStream, Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
}

#[derive(Clone)]
pub struct MemoryStorage {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    base_url: String,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            base_url: "memory://formdrop".to_string(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.content_type.clone())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String> {
        validate_key(key)?;
        let size = data.len();
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        tracing::debug!(key = %key, size_bytes = size, "Memory storage put");
        Ok(self.url(key))
    }

    async fn put_stream(
        &self,
        key: &str,
        content_type: &str,
        _content_length: u64,
        stream: ByteStream,
    ) -> StorageResult<String> {
        validate_key(key)?;
        let data = stream
            .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;
        self.put(key, data.freeze(), content_type).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        validate_key(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let data = self.get(key).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn content_length(&self, key: &str) -> StorageResult<u64> {
        Ok(self.get(key).await?.len() as u64)
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        validate_key(key)?;
        if !self.objects.read().await.contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(format!("{}?expires_in={}", self.url(key), expires_in.as_secs()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.objects.read().await.contains_key(key))
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_list_delete() {
        let storage = MemoryStorage::new();
        storage
            .put("staging/a/2", Bytes::from_static(b"cd"), "application/octet-stream")
            .await
            .unwrap();
        storage
            .put("staging/a/1", Bytes::from_static(b"ab"), "application/octet-stream")
            .await
            .unwrap();
        storage
            .put("staging/b/1", Bytes::from_static(b"zz"), "application/octet-stream")
            .await
            .unwrap();

        assert_eq!(
            storage.list("staging/a/").await.unwrap(),
            vec!["staging/a/1".to_string(), "staging/a/2".to_string()]
        );
        assert_eq!(storage.get("staging/a/1").await.unwrap(), Bytes::from_static(b"ab"));

        storage.delete("staging/a/1").await.unwrap();
        assert!(!storage.exists("staging/a/1").await.unwrap());
        assert!(matches!(
            storage.get("staging/a/1").await,
            Err(StorageError::NotFound(_))
        ));
        // deleting twice is fine
        storage.delete("staging/a/1").await.unwrap();
    }

    #[tokio::test]
    async fn failed_stream_leaves_previous_object() {
        let storage = MemoryStorage::new();
        storage
            .put("uploads/a", Bytes::from_static(b"old"), "text/plain")
            .await
            .unwrap();

        let parts: Vec<StorageResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"new")),
            Err(StorageError::Inconsistent("gap".to_string())),
        ];
        let result = storage
            .put_stream("uploads/a", "text/plain", 6, Box::pin(futures::stream::iter(parts)))
            .await;

        assert!(matches!(result, Err(StorageError::Inconsistent(_))));
        assert_eq!(storage.get("uploads/a").await.unwrap(), Bytes::from_static(b"old"));
        assert_eq!(storage.content_length("uploads/a").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.put("../x", Bytes::new(), "text/plain").await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
