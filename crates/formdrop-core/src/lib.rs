//! formdrop core library
//!
//! Domain models, error types, lifecycle hooks, upload metadata validation, and
//! configuration shared by every formdrop component.

pub mod config;
pub mod constants;
pub mod error;
pub mod hooks;
pub mod job_error;
pub mod models;
pub mod storage_types;
pub mod validation;

pub use config::{BaseConfig, Config, SessionStore, UploadServiceConfig};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use hooks::{AuthContext, HookRegistry, HookRejection, OnCompleteHook, OnCreateHook};
pub use job_error::JobError;
pub use storage_types::StorageBackend;
pub use validation::{UploadPolicy, UploadValidationError};
