//! Storage abstraction trait
//!
//! This module defines the Storage trait that all storage backends must implement.

use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Storage operation errors
///
/// `Unauthorized`, `Unavailable` and `Timeout` are kept distinct so callers can
/// tell permanent failures from transient ones.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Access denied: {0}")]
    Unauthorized(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage operation timed out: {0}")]
    Timeout(String),

    /// Staged chunks do not form a contiguous byte range of the expected size.
    #[error("Inconsistent staging data: {0}")]
    Inconsistent(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Object content delivered piecewise, so large objects never sit in memory whole.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Storage abstraction trait
///
/// All storage backends (S3, local filesystem, memory) implement this trait.
/// Keys are opaque `/`-separated paths; see the crate root for the layout.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write `data` under `key`, replacing any existing object. Returns the object's URL.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String>;

    /// Write the contents of `stream` under `key`.
    ///
    /// The object becomes visible only once the stream has been fully
    /// consumed. An error from the stream aborts the write, leaves any
    /// previous object in place and is returned unchanged.
    async fn put_stream(
        &self,
        key: &str,
        content_type: &str,
        content_length: u64,
        stream: ByteStream,
    ) -> StorageResult<String>;

    /// Read the full object stored under `key`
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Read the object stored under `key` as a stream
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Size in bytes of the object under `key`; `NotFound` if there is none
    async fn content_length(&self, key: &str) -> StorageResult<u64>;

    /// Generate a time-limited URL granting read access to `key`
    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String>;

    /// Delete `key`. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Keys starting with `prefix`, in ascending lexicographic order
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    fn backend_type(&self) -> StorageBackend;

    /// Bucket name for backends that have one
    fn bucket(&self) -> Option<&str> {
        None
    }
}

/// Reject keys that could escape a backend's namespace.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.contains("..") || key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(format!(
            "Storage key '{}' contains invalid characters",
            key
        )));
    }
    Ok(())
}
