use crate::traits::{validate_key, ByteStream, Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::Method;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::Error as ObjectStoreError;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectMeta, ObjectStore, ObjectStoreExt,
    PutMultipartOptions, PutOptions, PutPayload, Result as ObjectResult, WriteMultipart,
};
use std::time::Duration;

/// Objects up to this size are sent in a single request.
const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;
/// In-flight part uploads per multipart write.
const MULTIPART_CONCURRENCY: usize = 4;

fn content_type_attributes(content_type: &str) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(
        Attribute::ContentType,
        AttributeValue::from(content_type.to_string()),
    );
    attributes
}

/// S3 storage implementation
#[derive(Clone)]
pub struct S3Storage {
    store: AmazonS3,
    bucket: String,
    region: String,
    endpoint_url: Option<String>, // Custom endpoint for S3-compatible providers
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// # Arguments
    /// * `bucket` - S3 bucket name
    /// * `region` - AWS region (or region identifier for S3-compatible providers)
    /// * `endpoint_url` - Optional custom endpoint URL for S3-compatible providers
    ///   (e.g., "http://localhost:9000" for MinIO)
    pub async fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
    ) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region.clone())
            .with_bucket_name(bucket.clone());

        if let Some(ref endpoint) = endpoint_url {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(S3Storage {
            store,
            bucket,
            region,
            endpoint_url,
        })
    }

    /// Public URL for an S3 object
    ///
    /// AWS: `https://{bucket}.s3.{region}.amazonaws.com/{key}`; S3-compatible
    /// providers use path style `{endpoint}/{bucket}/{key}`.
    fn generate_url(&self, key: &str) -> String {
        if let Some(ref endpoint) = self.endpoint_url {
            let base_url = endpoint.trim_end_matches('/');
            format!("{}/{}/{}", base_url, self.bucket, key)
        } else {
            format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            )
        }
    }
}

/// Translate an object_store error, keeping auth and availability failures distinguishable.
fn map_error(err: ObjectStoreError, key: &str, fallback: fn(String) -> StorageError) -> StorageError {
    match err {
        ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.to_string()),
        ObjectStoreError::PermissionDenied { .. } | ObjectStoreError::Unauthenticated { .. } => {
            StorageError::Unauthorized(err.to_string())
        }
        ObjectStoreError::InvalidPath { .. } => StorageError::InvalidKey(err.to_string()),
        other => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            if lower.contains("timed out") || lower.contains("timeout") {
                StorageError::Timeout(message)
            } else if lower.contains("connection refused")
                || lower.contains("error sending request")
                || lower.contains("service unavailable")
            {
                StorageError::Unavailable(message)
            } else {
                fallback(message)
            }
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String> {
        validate_key(key)?;
        let size = data.len() as u64;
        let location = Path::from(key.to_string());
        let start = std::time::Instant::now();

        let opts = PutOptions {
            attributes: content_type_attributes(content_type),
            ..Default::default()
        };

        let result: ObjectResult<_> = self
            .store
            .put_opts(&location, PutPayload::from(data), opts)
            .await;

        result.map_err(|e| {
            tracing::error!(
                error = %e,
                bucket = %self.bucket,
                key = %key,
                size_bytes = size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 put failed"
            );
            map_error(e, key, StorageError::UploadFailed)
        })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 put successful"
        );

        Ok(self.generate_url(key))
    }

    async fn put_stream(
        &self,
        key: &str,
        content_type: &str,
        content_length: u64,
        mut stream: ByteStream,
    ) -> StorageResult<String> {
        validate_key(key)?;
        if content_length <= MULTIPART_THRESHOLD {
            let mut buffer = bytes::BytesMut::new();
            while let Some(chunk) = stream.try_next().await? {
                buffer.extend_from_slice(&chunk);
            }
            return self.put(key, buffer.freeze(), content_type).await;
        }

        let location = Path::from(key.to_string());
        let start = std::time::Instant::now();
        let opts = PutMultipartOptions {
            attributes: content_type_attributes(content_type),
            ..Default::default()
        };
        let upload = self
            .store
            .put_multipart_opts(&location, opts)
            .await
            .map_err(|e| map_error(e, key, StorageError::UploadFailed))?;
        let mut writer = WriteMultipart::new(upload);

        let mut written = 0u64;
        let copied: StorageResult<()> = async {
            while let Some(chunk) = stream.try_next().await? {
                writer
                    .wait_for_capacity(MULTIPART_CONCURRENCY)
                    .await
                    .map_err(|e| map_error(e, key, StorageError::UploadFailed))?;
                written += chunk.len() as u64;
                writer.put(chunk);
            }
            Ok(())
        }
        .await;

        if let Err(e) = copied {
            tracing::error!(
                error = %e,
                bucket = %self.bucket,
                key = %key,
                size_bytes = written,
                "S3 multipart upload failed, aborting"
            );
            if let Err(abort) = writer.abort().await {
                tracing::warn!(error = %abort, key = %key, "Failed to abort S3 multipart upload");
            }
            return Err(e);
        }

        writer
            .finish()
            .await
            .map_err(|e| map_error(e, key, StorageError::UploadFailed))?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = written,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 multipart upload successful"
        );

        Ok(self.generate_url(key))
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        validate_key(key)?;
        let location = Path::from(key.to_string());

        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| map_error(e, key, StorageError::DownloadFailed))?;

        result
            .bytes()
            .await
            .map_err(|e| map_error(e, key, StorageError::DownloadFailed))
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        validate_key(key)?;
        let location = Path::from(key.to_string());

        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| map_error(e, key, StorageError::DownloadFailed))?;

        let key = key.to_string();
        let stream = result
            .into_stream()
            .map(move |chunk| chunk.map_err(|e| map_error(e, &key, StorageError::DownloadFailed)));
        Ok(Box::pin(stream))
    }

    async fn content_length(&self, key: &str) -> StorageResult<u64> {
        validate_key(key)?;
        let location = Path::from(key.to_string());
        let meta = self
            .store
            .head(&location)
            .await
            .map_err(|e| map_error(e, key, StorageError::BackendError))?;
        Ok(meta.size)
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        validate_key(key)?;
        let location = Path::from(key.to_string());
        let url_result: ObjectResult<_> = self
            .store
            .signed_url(Method::GET, &location, expires_in)
            .await;

        let url = url_result
            .map_err(|e| map_error(e, key, StorageError::BackendError))?
            .to_string();

        Ok(url)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let location = Path::from(key.to_string());

        match self.store.delete(&location).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    "S3 delete failed"
                );
                Err(map_error(e, key, StorageError::DeleteFailed))
            }
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // object_store prefixes are whole path segments; filter the rest here.
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let dir_path = Path::from(dir.to_string());
        let listing = if dir.is_empty() { None } else { Some(&dir_path) };

        let metas: Vec<ObjectMeta> = self
            .store
            .list(listing)
            .try_collect()
            .await
            .map_err(|e| map_error(e, prefix, StorageError::BackendError))?;

        let mut keys: Vec<String> = metas
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        let location = Path::from(key.to_string());
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_error(e, key, StorageError::BackendError)),
        }
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }

    fn bucket(&self) -> Option<&str> {
        Some(&self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn custom_endpoint_uses_path_style_urls() {
        let storage = S3Storage::new(
            "forms".to_string(),
            "us-east-1".to_string(),
            Some("http://localhost:9000/".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(
            storage.generate_url("uploads/f/s/a.pdf"),
            "http://localhost:9000/forms/uploads/f/s/a.pdf"
        );
        assert_eq!(storage.bucket(), Some("forms"));
    }

    #[test]
    fn maps_not_found() {
        let err = ObjectStoreError::NotFound {
            path: "uploads/x".to_string(),
            source: "missing".into(),
        };
        assert!(matches!(
            map_error(err, "uploads/x", StorageError::BackendError),
            StorageError::NotFound(_)
        ));
    }
}
