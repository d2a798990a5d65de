//! Transient/permanent classification of failures seen while processing a job.

use formdrop_core::models::UploadErrorCode;
use formdrop_core::{AppError, JobError};
use formdrop_storage::StorageError;

const AUTH_MARKERS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "unauthenticated",
    "forbidden",
    "access denied",
    "accessdenied",
    "invalidaccesskeyid",
    "signaturedoesnotmatch",
];

const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "etimedout"];

/// Classify a storage failure.
///
/// Structured variants decide directly. Backend errors that only carry a
/// message are sniffed for auth and timeout markers; everything else is
/// treated as a transient availability problem.
pub fn classify_storage_error(err: StorageError) -> JobError {
    match err {
        StorageError::Unauthorized(_) => JobError::unrecoverable(err, UploadErrorCode::PermissionDenied),
        StorageError::Timeout(_) => JobError::recoverable(err, UploadErrorCode::NetworkTimeout),
        StorageError::Unavailable(_) => {
            JobError::recoverable(err, UploadErrorCode::StorageUploadFailed)
        }
        StorageError::InvalidKey(_) | StorageError::NotFound(_) | StorageError::Inconsistent(_) => {
            JobError::unrecoverable(err, UploadErrorCode::InvalidFile)
        }
        StorageError::ConfigError(_) => {
            JobError::unrecoverable(err, UploadErrorCode::PermissionDenied)
        }
        StorageError::UploadFailed(_)
        | StorageError::DownloadFailed(_)
        | StorageError::DeleteFailed(_)
        | StorageError::BackendError(_)
        | StorageError::IoError(_) => classify_message(err),
    }
}

fn classify_message(err: StorageError) -> JobError {
    let message = err.to_string().to_lowercase();
    if AUTH_MARKERS.iter().any(|m| message.contains(m)) {
        JobError::unrecoverable(err, UploadErrorCode::PermissionDenied)
    } else if TIMEOUT_MARKERS.iter().any(|m| message.contains(m)) {
        JobError::recoverable(err, UploadErrorCode::NetworkTimeout)
    } else {
        JobError::recoverable(err, UploadErrorCode::StorageUploadFailed)
    }
}

/// Classify a failure from the submission repository.
pub fn classify_submission_error(err: AppError) -> JobError {
    match err {
        AppError::NotFound(_) | AppError::InvalidInput(_) | AppError::BadRequest(_) => {
            JobError::unrecoverable(err, UploadErrorCode::InvalidFile)
        }
        AppError::Unauthorized(_) => JobError::unrecoverable(err, UploadErrorCode::PermissionDenied),
        other => JobError::recoverable(other, UploadErrorCode::StorageUploadFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(err: StorageError) -> (bool, UploadErrorCode) {
        let job_error = classify_storage_error(err);
        (job_error.is_recoverable(), job_error.code())
    }

    #[test]
    fn connection_refused_is_transient() {
        assert_eq!(
            classify(StorageError::Unavailable("connect ECONNREFUSED 127.0.0.1:9000".into())),
            (true, UploadErrorCode::StorageUploadFailed)
        );
        assert_eq!(
            classify(StorageError::BackendError("503 Service Unavailable".into())),
            (true, UploadErrorCode::StorageUploadFailed)
        );
    }

    #[test]
    fn timeouts_are_transient_network_errors() {
        assert_eq!(
            classify(StorageError::Timeout("put".into())),
            (true, UploadErrorCode::NetworkTimeout)
        );
        assert_eq!(
            classify(StorageError::UploadFailed("operation timed out".into())),
            (true, UploadErrorCode::NetworkTimeout)
        );
    }

    #[test]
    fn auth_failures_are_permanent() {
        assert_eq!(
            classify(StorageError::Unauthorized("bad key".into())),
            (false, UploadErrorCode::PermissionDenied)
        );
        assert_eq!(
            classify(StorageError::UploadFailed("401 Unauthorized".into())),
            (false, UploadErrorCode::PermissionDenied)
        );
        assert_eq!(
            classify(StorageError::BackendError("AccessDenied: 403".into())),
            (false, UploadErrorCode::PermissionDenied)
        );
    }

    #[test]
    fn missing_or_broken_staging_is_invalid_file() {
        assert_eq!(
            classify(StorageError::NotFound("staging/x/".into())),
            (false, UploadErrorCode::InvalidFile)
        );
        assert_eq!(
            classify(StorageError::Inconsistent("gap".into())),
            (false, UploadErrorCode::InvalidFile)
        );
    }

    #[test]
    fn submission_errors() {
        let missing = classify_submission_error(AppError::NotFound("sub".into()));
        assert!(!missing.is_recoverable());
        assert_eq!(missing.code(), UploadErrorCode::InvalidFile);

        let db = classify_submission_error(AppError::Internal("pool timed out".into()));
        assert!(db.is_recoverable());
    }
}
