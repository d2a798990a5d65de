use formdrop_core::{AppError, HookRejection, UploadValidationError};
use formdrop_storage::StorageError;

/// Errors returned by transfer session operations.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Validation(#[from] UploadValidationError),

    #[error("Upload rejected: {0}")]
    Rejected(#[from] HookRejection),

    #[error("Upload session {0} not found")]
    NotFound(String),

    #[error("Upload-Offset {actual} does not match current offset {expected}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("Chunk of {len} bytes at offset {offset} exceeds Upload-Length {total}")]
    ChunkOverrun { offset: u64, len: u64, total: u64 },

    #[error("Chunk of {len} bytes exceeds the maximum chunk size of {max}")]
    ChunkTooLarge { len: u64, max: u64 },

    #[error("Upload session {0} is being written by another request")]
    Locked(String),

    #[error("Upload session {0} is complete and awaiting handoff")]
    HandoffPending(String),

    #[error("Staging error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Repository(#[from] AppError),
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Validation(e) => e.into(),
            TransferError::Rejected(e) => AppError::InvalidInput(e.to_string()),
            TransferError::NotFound(_) => AppError::NotFound(err.to_string()),
            TransferError::OffsetMismatch { .. } | TransferError::HandoffPending(_) => {
                AppError::Conflict(err.to_string())
            }
            TransferError::ChunkOverrun { .. } => AppError::BadRequest(err.to_string()),
            TransferError::ChunkTooLarge { .. } => AppError::PayloadTooLarge(err.to_string()),
            TransferError::Locked(_) => AppError::Locked(err.to_string()),
            TransferError::Storage(e) => AppError::Storage(e.to_string()),
            TransferError::Repository(e) => e,
        }
    }
}
