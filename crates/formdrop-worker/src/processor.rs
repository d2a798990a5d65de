use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use formdrop_core::models::{SubmissionFileReference, UploadErrorCode, UploadJob, UploadResult};
use formdrop_core::{Config, JobError};
use formdrop_db::SubmissionRepository;
use formdrop_storage::keys::upload_key;
use formdrop_storage::{StagingArea, Storage, StorageError};

use crate::classify::{classify_storage_error, classify_submission_error};

/// Runs one attempt of a leased job.
///
/// The worker pool calls `handle` with the job snapshot it leased and routes
/// the outcome to the queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &UploadJob) -> Result<UploadResult, JobError>;
}

/// Moves a completed upload from staging to its durable key and records it
/// on the owning submission.
#[derive(Clone)]
pub struct UploadJobProcessor {
    storage: Arc<dyn Storage>,
    staging: StagingArea,
    submissions: Arc<dyn SubmissionRepository>,
    signed_url_expiry: Duration,
    operation_timeout: Duration,
}

impl UploadJobProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        submissions: Arc<dyn SubmissionRepository>,
        signed_url_expiry: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            staging: StagingArea::new(storage.clone()),
            storage,
            submissions,
            signed_url_expiry,
            operation_timeout,
        }
    }

    pub fn from_config(
        storage: Arc<dyn Storage>,
        submissions: Arc<dyn SubmissionRepository>,
        config: &Config,
    ) -> Self {
        Self::new(
            storage,
            submissions,
            config.signed_url_expiry(),
            config.storage_operation_timeout(),
        )
    }

    /// Bound `fut` by the storage operation timeout.
    async fn bounded<T, E>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, E>>,
        classify: fn(E) -> JobError,
    ) -> Result<T, JobError> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(JobError::recoverable(
                anyhow::anyhow!(
                    "{} timed out after {}s",
                    operation,
                    self.operation_timeout.as_secs_f64()
                ),
                UploadErrorCode::NetworkTimeout,
            )),
        }
    }

    /// Whether an earlier attempt already wrote the complete object at `key`.
    ///
    /// Durable writes are atomic on every backend, so an object of the
    /// expected size is the finished upload.
    async fn already_stored(&self, key: &str, size: u64) -> Result<bool, JobError> {
        let stored = self
            .bounded(
                "storage head",
                async {
                    match self.storage.content_length(key).await {
                        Ok(len) => Ok(Some(len)),
                        Err(StorageError::NotFound(_)) => Ok(None),
                        Err(e) => Err(e),
                    }
                },
                classify_storage_error,
            )
            .await?;
        Ok(stored == Some(size))
    }
}

#[async_trait]
impl JobHandler for UploadJobProcessor {
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, session_id = %job.source_session_id()))]
    async fn handle(&self, job: &UploadJob) -> Result<UploadResult, JobError> {
        let payload = &job.payload;
        payload.validate().map_err(|reason| {
            JobError::unrecoverable(
                anyhow::anyhow!("Malformed job metadata: {}", reason),
                UploadErrorCode::InvalidFile,
            )
        })?;
        let session_id = payload.tus_upload_id.as_str();
        let start = Instant::now();

        let key = upload_key(&payload.form_id, session_id, &payload.file_name);
        if self.already_stored(&key, payload.file_size).await? {
            tracing::info!(key = %key, "Upload already stored by an earlier attempt");
        } else {
            let chunks = self
                .bounded(
                    "staging read",
                    self.staging.stream_all(session_id, payload.file_size),
                    classify_storage_error,
                )
                .await?;
            // The copy itself is bounded by the job timeout.
            self.storage
                .put_stream(&key, &payload.content_type, payload.file_size, chunks)
                .await
                .map_err(classify_storage_error)?;
        }

        let url = self
            .bounded(
                "signed url",
                self.storage.signed_url(&key, self.signed_url_expiry),
                classify_storage_error,
            )
            .await?;

        match payload.submission_id.as_deref() {
            Some(submission_id) => {
                let reference = SubmissionFileReference {
                    url: url.clone(),
                    name: payload.file_name.clone(),
                    size: payload.file_size,
                    content_type: payload.content_type.clone(),
                    storage: self.storage.backend_type().to_string(),
                    key: key.clone(),
                };
                self.bounded(
                    "submission update",
                    self.submissions
                        .set_file_field(submission_id, &payload.field_key, &reference),
                    classify_submission_error,
                )
                .await?;
            }
            None => {
                tracing::info!(
                    form_id = %payload.form_id,
                    "Upload has no submission yet, skipping submission update"
                );
            }
        }

        let removed = self
            .bounded(
                "staging cleanup",
                self.staging.delete_all(session_id),
                classify_storage_error,
            )
            .await?;
        tracing::debug!(chunks_removed = removed, "Staging cleared");

        tracing::info!(
            key = %key,
            size_bytes = payload.file_size,
            duration_ms = start.elapsed().as_millis() as u64,
            "Upload stored"
        );

        Ok(UploadResult {
            success: true,
            storage_url: Some(url),
            storage_key: Some(key),
            bucket: self.storage.bucket().map(str::to_string),
            size: Some(payload.file_size),
            ..Default::default()
        })
    }
}
