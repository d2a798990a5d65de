//! formdrop storage library
//!
//! The [`Storage`] trait is the object-storage capability used by the transfer
//! server (for staged chunks) and by the upload workers (for durable objects).
//! Implementations exist for S3 (via `object_store`), the local filesystem and
//! process memory.
//!
//! # Key layout
//!
//! - Staged chunks: `staging/{session_id}/{offset:020}`
//! - Durable uploads: `uploads/{form_id}/{session_id}/{filename}`
//!
//! Keys must not contain `..` or a leading `/`. Key generation is centralized
//! in [`keys`] so every backend and caller agrees on it.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
pub mod memory;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod staging;
pub mod traits;

pub use factory::create_storage;
pub use formdrop_core::StorageBackend;
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
pub use memory::MemoryStorage;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use staging::StagingArea;
pub use traits::{ByteStream, Storage, StorageError, StorageResult};
