//! Backend selection from [`Config`].

#[cfg(feature = "storage-local")]
use crate::LocalStorage;
#[cfg(feature = "storage-s3")]
use crate::S3Storage;
use crate::{MemoryStorage, Storage, StorageBackend, StorageError, StorageResult};
use formdrop_core::Config;
use std::sync::Arc;

/// Create the storage backend named by `STORAGE_BACKEND`.
///
/// The same backend holds staged chunks and durable uploads.
pub async fn create_storage(config: &Config) -> StorageResult<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config.storage_backend() {
        StorageBackend::S3 => s3(config).await?,
        StorageBackend::Local => local(config).await?,
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; staged chunks and uploads are lost on restart");
            Arc::new(MemoryStorage::new())
        }
    };
    Ok(storage)
}

fn required<'a>(value: Option<&'a str>, var: &str) -> StorageResult<&'a str> {
    value.ok_or_else(|| StorageError::ConfigError(format!("{} not configured", var)))
}

#[cfg(feature = "storage-s3")]
async fn s3(config: &Config) -> StorageResult<Arc<dyn Storage>> {
    let bucket = required(config.s3_bucket(), "S3_BUCKET")?;
    let region = required(config.s3_region(), "S3_REGION or AWS_REGION")?;
    let storage = S3Storage::new(
        bucket.to_string(),
        region.to_string(),
        config.s3_endpoint().map(String::from),
    )
    .await?;
    Ok(Arc::new(storage))
}

#[cfg(not(feature = "storage-s3"))]
async fn s3(_config: &Config) -> StorageResult<Arc<dyn Storage>> {
    Err(StorageError::ConfigError(
        "STORAGE_BACKEND=s3 requires the storage-s3 feature".to_string(),
    ))
}

#[cfg(feature = "storage-local")]
async fn local(config: &Config) -> StorageResult<Arc<dyn Storage>> {
    let base_path = required(config.local_storage_path(), "LOCAL_STORAGE_PATH")?;
    let base_url = required(config.local_storage_base_url(), "LOCAL_STORAGE_BASE_URL")?;
    let storage = LocalStorage::new(base_path, base_url.to_string()).await?;
    Ok(Arc::new(storage))
}

#[cfg(not(feature = "storage-local"))]
async fn local(_config: &Config) -> StorageResult<Arc<dyn Storage>> {
    Err(StorageError::ConfigError(
        "STORAGE_BACKEND=local requires the storage-local feature".to_string(),
    ))
}
