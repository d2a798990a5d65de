//! Job execution error types
//!
//! A worker reports every failed attempt as a [`JobError`]. The error carries
//! whether another attempt could succeed and the [`UploadErrorCode`] recorded
//! on the job's result.

use std::fmt;

use crate::models::UploadErrorCode;

#[derive(Debug)]
pub struct JobError {
    inner: anyhow::Error,
    recoverable: bool,
    code: UploadErrorCode,
}

impl JobError {
    /// Create an unrecoverable error.
    ///
    /// The job moves straight to `failed` without consuming further attempts.
    /// Use this for authorization failures and for input that will not change
    /// on retry (missing staging bytes, malformed metadata).
    pub fn unrecoverable(err: impl Into<anyhow::Error>, code: UploadErrorCode) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
            code,
        }
    }

    /// Create a recoverable error, retried according to the queue's backoff policy.
    pub fn recoverable(err: impl Into<anyhow::Error>, code: UploadErrorCode) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
            code,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn code(&self) -> UploadErrorCode {
        self.code
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for JobError {
    /// Unclassified errors are treated as transient storage failures
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err, UploadErrorCode::StorageUploadFailed)
    }
}
