//! Upload job queue: enqueue, lease, heartbeat, completion, retry and stall handling.
//!
//! Every state change is computed here and persisted through a
//! [`JobRepository`] compare-and-set keyed on the lease token, so a worker
//! whose lease has been reclaimed can no longer record an outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use formdrop_core::models::{
    JobState, UploadErrorCode, UploadJob, UploadJobPayload, UploadResult,
};
use formdrop_core::JobError;
use formdrop_db::JobRepository;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::QueueError;
use crate::policy::RetryPolicy;

/// Failure reason recorded when a job exceeds its stall budget.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Stalled jobs examined per reclamation pass
const STALLED_BATCH_SIZE: i64 = 100;

/// A job together with the token identifying this worker's lease on it.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: UploadJob,
    pub token: Uuid,
}

impl LeasedJob {
    pub fn id(&self) -> Uuid {
        self.job.id
    }
}

/// A classified failed attempt, as handed to [`JobQueue::fail`].
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub message: String,
    pub code: UploadErrorCode,
    /// Skip the remaining attempts and dead-letter the job now.
    pub permanent: bool,
    pub processing_time_ms: u64,
}

impl JobFailure {
    pub fn from_job_error(err: &JobError, processing_time_ms: u64) -> Self {
        Self {
            message: format!("{:#}", err.inner()),
            code: err.code(),
            permanent: !err.is_recoverable(),
            processing_time_ms,
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    repository: Arc<dyn JobRepository>,
    policy: RetryPolicy,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(repository: Arc<dyn JobRepository>, policy: RetryPolicy) -> Self {
        Self {
            repository,
            policy,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Signalled whenever a job becomes ready in this process.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Enqueue a job for `payload`. Idempotent per source session: a second
    /// call returns the job created by the first.
    #[tracing::instrument(skip(self, payload), fields(session_id = %payload.tus_upload_id))]
    pub async fn enqueue(&self, payload: UploadJobPayload) -> Result<UploadJob, QueueError> {
        let job = UploadJob::new(payload, self.policy.max_attempts, Utc::now());
        let (stored, inserted) = self.repository.insert_if_absent(&job).await?;
        if inserted {
            tracing::info!(
                job_id = %stored.id,
                file_size = stored.payload.file_size,
                "Upload job enqueued"
            );
            self.notify.notify_one();
        }
        Ok(stored)
    }

    /// Lease the next ready job for `worker_id`, if any.
    pub async fn lease(&self, worker_id: &str) -> Result<Option<LeasedJob>, QueueError> {
        let now = Utc::now();
        let token = Uuid::new_v4();
        let leased = self
            .repository
            .lease_next(worker_id, token, now, now + self.policy.lease_chrono())
            .await?;

        Ok(leased.map(|job| {
            tracing::debug!(
                job_id = %job.id,
                worker_id = %worker_id,
                attempt = job.attempts_made + 1,
                "Job leased"
            );
            LeasedJob { job, token }
        }))
    }

    /// Renew a lease. `false` means the lease is lost and the worker must stop.
    pub async fn heartbeat(&self, leased: &LeasedJob) -> Result<bool, QueueError> {
        let until = Utc::now() + self.policy.lease_chrono();
        Ok(self
            .repository
            .renew_lease(leased.id(), leased.token, until)
            .await?)
    }

    /// Record a successful attempt.
    #[tracing::instrument(skip(self, leased, result), fields(job_id = %leased.id()))]
    pub async fn complete(
        &self,
        leased: &LeasedJob,
        mut result: UploadResult,
    ) -> Result<UploadJob, QueueError> {
        let now = Utc::now();
        let mut job = leased.job.clone();
        job.attempts_made += 1;
        result.success = true;
        result.retry_count = Some(job.attempts_made - 1);
        job.result = Some(result);
        job.state = JobState::Completed;
        job.lease = None;
        job.updated_at = now;
        job.finished_at = Some(now);

        self.persist(&job, leased.token).await?;
        tracing::info!(attempts = job.attempts_made, "Upload job completed");
        Ok(job)
    }

    /// Record a failed attempt.
    ///
    /// Transient failures return the job to `waiting` after the backoff delay
    /// until the attempt budget is spent; permanent failures and the last
    /// attempt move it to `failed`.
    #[tracing::instrument(skip(self, leased, failure), fields(job_id = %leased.id(), permanent = failure.permanent))]
    pub async fn fail(
        &self,
        leased: &LeasedJob,
        failure: &JobFailure,
    ) -> Result<UploadJob, QueueError> {
        let now = Utc::now();
        let mut job = leased.job.clone();
        let retry = !failure.permanent && job.can_retry_after_failure();
        job.attempts_made += 1;
        job.last_error = Some(failure.message.clone());
        job.lease = None;
        job.updated_at = now;

        if !retry {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            job.result = Some(UploadResult::failure(
                failure.message.clone(),
                failure.code,
                job.attempts_made - 1,
                failure.processing_time_ms,
            ));
            self.persist(&job, leased.token).await?;
            tracing::error!(
                attempts = job.attempts_made,
                error_code = %failure.code,
                reason = %failure.message,
                "Upload job failed"
            );
        } else {
            let delay = self.policy.backoff_for(job.attempts_made);
            job.state = JobState::Waiting;
            job.available_at = now + chrono_delay(delay);
            self.persist(&job, leased.token).await?;
            tracing::warn!(
                attempts = job.attempts_made,
                max_attempts = job.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error_code = %failure.code,
                reason = %failure.message,
                "Upload job attempt failed, retry scheduled"
            );
        }
        Ok(job)
    }

    /// Return jobs whose lease expired to the queue, or fail them once they
    /// have stalled more than the policy allows. Returns the number handled.
    #[tracing::instrument(skip(self))]
    pub async fn reclaim_stalled(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let stalled = self
            .repository
            .find_stalled(now, STALLED_BATCH_SIZE)
            .await?;

        let mut reclaimed = 0;
        for mut job in stalled {
            let Some(token) = job.lease.as_ref().map(|l| l.token) else {
                continue;
            };
            job.stalled_count += 1;
            job.lease = None;
            job.updated_at = now;

            let failed = job.stalled_count > self.policy.max_stalled_count;
            if failed {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                job.last_error = Some(STALLED_REASON.to_string());
                job.result = Some(UploadResult::failure(
                    STALLED_REASON,
                    UploadErrorCode::StorageUploadFailed,
                    (job.attempts_made - 1).max(0),
                    0,
                ));
            } else {
                job.state = JobState::Waiting;
                job.available_at = now;
            }

            if !self.repository.save_if_stalled(&job, token, now).await? {
                continue;
            }
            reclaimed += 1;
            if failed {
                tracing::error!(job_id = %job.id, stalled_count = job.stalled_count, "Upload job failed after stalling");
            } else {
                tracing::warn!(job_id = %job.id, stalled_count = job.stalled_count, "Stalled upload job returned to queue");
                self.notify.notify_one();
            }
        }
        Ok(reclaimed)
    }

    /// Delete finished jobs outside the retention windows.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let removed = self
            .repository
            .prune(
                now - self.policy.completed_retention,
                self.policy.completed_retention_count,
                now - self.policy.failed_retention,
            )
            .await?;
        if removed > 0 {
            tracing::info!(removed = removed, "Pruned finished upload jobs");
        }
        Ok(removed)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<UploadJob>, QueueError> {
        Ok(self.repository.get(id).await?)
    }

    pub async fn find_by_session(&self, session_id: &str) -> Result<Option<UploadJob>, QueueError> {
        Ok(self.repository.find_by_session(session_id).await?)
    }

    /// How long an idle worker may sleep before a delayed job becomes ready,
    /// capped at `max`.
    pub async fn idle_wait(&self, max: Duration) -> Duration {
        match self.repository.next_available_at().await {
            Ok(Some(at)) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(max),
            _ => max,
        }
    }

    async fn persist(&self, job: &UploadJob, token: Uuid) -> Result<(), QueueError> {
        if self.repository.save_if_leased(job, token).await? {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(job.id))
        }
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(52))
}
