//! Validation modules

pub mod metadata;

pub use metadata::{
    parse_upload_metadata, UploadPolicy, UploadValidationError, MAX_METADATA_PAIRS,
};
