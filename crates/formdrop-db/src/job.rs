use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use formdrop_core::models::{JobLease, JobState, UploadJob, UploadJobPayload, UploadResult};
use formdrop_core::AppError;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Channel the pool LISTENs on; every new job sends one notification.
pub const NEW_JOB_CHANNEL: &str = "formdrop_new_job";

/// Durable store behind the job queue.
///
/// The queue decides every state change; the repository persists it. Writes
/// made on behalf of a worker are compare-and-set on the lease token so a
/// worker that lost its lease can never overwrite the new holder's progress.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert `job` unless a job for the same source session already exists.
    /// Returns the stored job and whether it was inserted by this call.
    async fn insert_if_absent(&self, job: &UploadJob) -> Result<(UploadJob, bool), AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<UploadJob>, AppError>;

    async fn find_by_session(&self, session_id: &str) -> Result<Option<UploadJob>, AppError>;

    /// Atomically move the oldest ready waiting job to `active` under a new lease.
    async fn lease_next(
        &self,
        owner: &str,
        token: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<UploadJob>, AppError>;

    /// Extend a lease. Returns false when `token` no longer holds the job.
    async fn renew_lease(
        &self,
        id: Uuid,
        token: Uuid,
        until: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Persist `job` if the lease identified by `token` is still the current one.
    async fn save_if_leased(&self, job: &UploadJob, token: Uuid) -> Result<bool, AppError>;

    /// Persist `job` if the lease identified by `token` is still current and
    /// expired before `now`. Used by stall reclamation.
    async fn save_if_stalled(
        &self,
        job: &UploadJob,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Active jobs whose lease expired before `now`
    async fn find_stalled(&self, now: DateTime<Utc>, limit: i64)
        -> Result<Vec<UploadJob>, AppError>;

    /// Earliest `available_at` among waiting jobs
    async fn next_available_at(&self) -> Result<Option<DateTime<Utc>>, AppError>;

    /// Delete completed jobs finished before `completed_before` or outside the
    /// `keep_completed` most recent, and failed jobs finished before `failed_before`.
    async fn prune(
        &self,
        completed_before: DateTime<Utc>,
        keep_completed: i64,
        failed_before: DateTime<Utc>,
    ) -> Result<u64, AppError>;
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    payload: serde_json::Value,
    state: String,
    attempts_made: i32,
    max_attempts: i32,
    stalled_count: i32,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
    available_at: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_token: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for UploadJob {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let payload: UploadJobPayload = serde_json::from_value(row.payload)
            .map_err(|e| AppError::Internal(format!("Corrupt job payload: {}", e)))?;
        let result: Option<UploadResult> = row
            .result
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AppError::Internal(format!("Corrupt job result: {}", e)))?;
        let lease = match (row.lease_owner, row.lease_token, row.lease_expires_at) {
            (Some(owner), Some(token), Some(expires_at)) => Some(JobLease {
                owner,
                token,
                expires_at,
            }),
            _ => None,
        };

        Ok(UploadJob {
            id: row.id,
            payload,
            state,
            attempts_made: row.attempts_made,
            max_attempts: row.max_attempts,
            stalled_count: row.stalled_count,
            last_error: row.last_error,
            result,
            available_at: row.available_at,
            lease,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, payload, state, attempts_made, max_attempts, stalled_count, \
     last_error, result, available_at, lease_owner, lease_token, lease_expires_at, \
     created_at, updated_at, finished_at";

#[derive(Clone)]
pub struct PostgresJobRepository {
    pool: PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write the mutable columns of `job` guarded by an extra SQL condition.
    /// `$1` is the job id, `$2` the lease token; `extra_guard` may use `$14`.
    async fn save_guarded(
        &self,
        job: &UploadJob,
        token: Uuid,
        extra_guard: &str,
        now: Option<DateTime<Utc>>,
    ) -> Result<bool, AppError> {
        let result = job.result.as_ref().map(serde_json::to_value).transpose()?;
        let sql = format!(
            r#"
            UPDATE upload_jobs
            SET state = $3,
                attempts_made = $4,
                stalled_count = $5,
                last_error = $6,
                result = $7,
                available_at = $8,
                lease_owner = $9,
                lease_token = $10,
                lease_expires_at = $11,
                updated_at = $12,
                finished_at = $13
            WHERE id = $1 AND state = 'active' AND lease_token = $2 {}
            "#,
            extra_guard
        );

        let mut query = sqlx::query(&sql)
            .bind(job.id)
            .bind(token)
            .bind(job.state.as_str())
            .bind(job.attempts_made)
            .bind(job.stalled_count)
            .bind(job.last_error.as_deref())
            .bind(result)
            .bind(job.available_at)
            .bind(job.lease.as_ref().map(|l| l.owner.clone()))
            .bind(job.lease.as_ref().map(|l| l.token))
            .bind(job.lease.as_ref().map(|l| l.expires_at))
            .bind(job.updated_at)
            .bind(job.finished_at);
        if let Some(now) = now {
            query = query.bind(now);
        }

        let outcome = query.execute(&self.pool).await?;
        Ok(outcome.rows_affected() > 0)
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, session_id = %job.source_session_id()))]
    async fn insert_if_absent(&self, job: &UploadJob) -> Result<(UploadJob, bool), AppError> {
        let payload = serde_json::to_value(&job.payload)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO upload_jobs (
                id, source_session_id, payload, state, attempts_made, max_attempts,
                stalled_count, available_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (source_session_id) DO NOTHING
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job.id)
        .bind(job.source_session_id())
        .bind(payload)
        .bind(job.state.as_str())
        .bind(job.attempts_made)
        .bind(job.max_attempts)
        .bind(job.stalled_count)
        .bind(job.available_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            let existing = self
                .find_by_session(job.source_session_id())
                .await?
                .ok_or_else(|| {
                    AppError::Internal(format!(
                        "Job for session {} conflicted but could not be read back",
                        job.source_session_id()
                    ))
                })?;
            tracing::debug!(job_id = %existing.id, "Job already enqueued for session");
            return Ok((existing, false));
        };

        // Workers poll as well, so a failed notification only delays pickup.
        if let Err(e) = sqlx::query("SELECT pg_notify($1, '')")
            .bind(NEW_JOB_CHANNEL)
            .execute(&mut *tx)
            .await
        {
            tracing::warn!(
                error = %e,
                "Failed to send pg_notify for new job, workers will discover it via polling"
            );
        }

        tx.commit().await?;

        Ok((UploadJob::try_from(row)?, true))
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadJob>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM upload_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UploadJob::try_from).transpose()
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Option<UploadJob>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM upload_jobs WHERE source_session_id = $1",
            JOB_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UploadJob::try_from).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn lease_next(
        &self,
        owner: &str,
        token: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<UploadJob>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            WITH next AS (
                SELECT id AS next_id
                FROM upload_jobs
                WHERE state = 'waiting' AND available_at <= $1
                ORDER BY available_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE upload_jobs
            SET state = 'active',
                lease_owner = $2,
                lease_token = $3,
                lease_expires_at = $4,
                updated_at = $1
            FROM next
            WHERE id = next.next_id
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(owner)
        .bind(token)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UploadJob::try_from).transpose()
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        token: Uuid,
        until: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET lease_expires_at = $3, updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND lease_token = $2
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(until)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, state = %job.state))]
    async fn save_if_leased(&self, job: &UploadJob, token: Uuid) -> Result<bool, AppError> {
        self.save_guarded(job, token, "", None).await
    }

    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, state = %job.state))]
    async fn save_if_stalled(
        &self,
        job: &UploadJob,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.save_guarded(job, token, "AND lease_expires_at < $14", Some(now))
            .await
    }

    async fn find_stalled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UploadJob>, AppError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {} FROM upload_jobs
            WHERE state = 'active' AND lease_expires_at < $1
            ORDER BY lease_expires_at ASC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UploadJob::try_from).collect()
    }

    async fn next_available_at(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        let next: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(available_at) FROM upload_jobs WHERE state = 'waiting'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    #[tracing::instrument(skip(self))]
    async fn prune(
        &self,
        completed_before: DateTime<Utc>,
        keep_completed: i64,
        failed_before: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            WITH ranked AS (
                SELECT id, finished_at,
                       ROW_NUMBER() OVER (ORDER BY finished_at DESC) AS rn
                FROM upload_jobs
                WHERE state = 'completed'
            ),
            deleted AS (
                DELETE FROM upload_jobs
                WHERE id IN (SELECT id FROM ranked WHERE finished_at < $1 OR rn > $2)
                   OR (state = 'failed' AND finished_at < $3)
                RETURNING id
            )
            SELECT COUNT(*)::bigint FROM deleted
            "#,
        )
        .bind(completed_before)
        .bind(keep_completed)
        .bind(failed_before)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = result.get(0);
        Ok(count.max(0) as u64)
    }
}

/// Process-local job store.
#[derive(Clone, Default)]
pub struct InMemoryJobRepository {
    jobs: Arc<RwLock<HashMap<Uuid, UploadJob>>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Every stored job, oldest first.
    pub async fn all(&self) -> Vec<UploadJob> {
        let mut jobs: Vec<UploadJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert_if_absent(&self, job: &UploadJob) -> Result<(UploadJob, bool), AppError> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs
            .values()
            .find(|j| j.source_session_id() == job.source_session_id())
        {
            return Ok((existing.clone(), false));
        }
        jobs.insert(job.id, job.clone());
        Ok((job.clone(), true))
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadJob>, AppError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Option<UploadJob>, AppError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|j| j.source_session_id() == session_id)
            .cloned())
    }

    async fn lease_next(
        &self,
        owner: &str,
        token: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<UploadJob>, AppError> {
        let mut jobs = self.jobs.write().await;
        let next = jobs
            .values_mut()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| (j.available_at, j.created_at));
        let Some(job) = next else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.lease = Some(JobLease {
            owner: owner.to_string(),
            token,
            expires_at: lease_until,
        });
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        token: Uuid,
        until: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) if job.is_leased_by(token) => {
                if let Some(lease) = job.lease.as_mut() {
                    lease.expires_at = until;
                }
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_if_leased(&self, job: &UploadJob, token: Uuid) -> Result<bool, AppError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(stored) if stored.is_leased_by(token) => {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_if_stalled(
        &self,
        job: &UploadJob,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(stored) if stored.is_leased_by(token) && stored.is_lease_expired(now) => {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stalled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UploadJob>, AppError> {
        let jobs = self.jobs.read().await;
        let mut stalled: Vec<UploadJob> = jobs
            .values()
            .filter(|j| j.is_lease_expired(now))
            .cloned()
            .collect();
        stalled.sort_by_key(|j| j.lease.as_ref().map(|l| l.expires_at));
        stalled.truncate(limit.max(0) as usize);
        Ok(stalled)
    }

    async fn next_available_at(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.state == JobState::Waiting)
            .map(|j| j.available_at)
            .min())
    }

    async fn prune(
        &self,
        completed_before: DateTime<Utc>,
        keep_completed: i64,
        failed_before: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut jobs = self.jobs.write().await;

        let mut completed: Vec<(Uuid, Option<DateTime<Utc>>)> = jobs
            .values()
            .filter(|j| j.state == JobState::Completed)
            .map(|j| (j.id, j.finished_at))
            .collect();
        completed.sort_by(|a, b| b.1.cmp(&a.1));

        let mut doomed: Vec<Uuid> = completed
            .iter()
            .enumerate()
            .filter(|(rank, (_, finished))| {
                *rank as i64 >= keep_completed
                    || finished.is_some_and(|at| at < completed_before)
            })
            .map(|(_, (id, _))| *id)
            .collect();
        doomed.extend(
            jobs.values()
                .filter(|j| {
                    j.state == JobState::Failed
                        && j.finished_at.is_some_and(|at| at < failed_before)
                })
                .map(|j| j.id),
        );

        for id in &doomed {
            jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(session_id: &str) -> UploadJob {
        UploadJob::new(
            UploadJobPayload {
                tus_upload_id: session_id.to_string(),
                file_name: "a.pdf".to_string(),
                file_size: 3,
                content_type: "application/pdf".to_string(),
                form_id: "form".to_string(),
                submission_id: None,
                field_key: "file".to_string(),
                user_id: None,
                metadata: None,
                uploaded_at: Utc::now(),
            },
            5,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_session() {
        let repo = InMemoryJobRepository::new();
        let first = job("s1");
        let (stored, inserted) = repo.insert_if_absent(&first).await.unwrap();
        assert!(inserted);
        assert_eq!(stored.id, first.id);

        let (stored, inserted) = repo.insert_if_absent(&job("s1")).await.unwrap();
        assert!(!inserted);
        assert_eq!(stored.id, first.id);
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let repo = InMemoryJobRepository::new();
        repo.insert_if_absent(&job("s1")).await.unwrap();
        let now = Utc::now();
        let until = now + Duration::seconds(30);

        let leased = repo
            .lease_next("w1", Uuid::new_v4(), now, until)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.state, JobState::Active);
        assert!(repo
            .lease_next("w2", Uuid::new_v4(), now, until)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_leased_early() {
        let repo = InMemoryJobRepository::new();
        let mut delayed = job("s1");
        delayed.available_at = Utc::now() + Duration::seconds(60);
        repo.insert_if_absent(&delayed).await.unwrap();

        let now = Utc::now();
        assert!(repo
            .lease_next("w1", Uuid::new_v4(), now, now + Duration::seconds(30))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            repo.next_available_at().await.unwrap(),
            Some(delayed.available_at)
        );
    }

    #[tokio::test]
    async fn save_requires_current_lease() {
        let repo = InMemoryJobRepository::new();
        repo.insert_if_absent(&job("s1")).await.unwrap();
        let now = Utc::now();
        let token = Uuid::new_v4();
        let mut leased = repo
            .lease_next("w1", token, now, now + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        leased.state = JobState::Completed;
        leased.lease = None;
        assert!(!repo.save_if_leased(&leased, Uuid::new_v4()).await.unwrap());
        assert!(repo.save_if_leased(&leased, token).await.unwrap());
        // the lease is gone now
        assert!(!repo.save_if_leased(&leased, token).await.unwrap());
        assert!(!repo
            .renew_lease(leased.id, token, now + Duration::seconds(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stalled_save_requires_expired_lease() {
        let repo = InMemoryJobRepository::new();
        repo.insert_if_absent(&job("s1")).await.unwrap();
        let now = Utc::now();
        let token = Uuid::new_v4();
        let leased = repo
            .lease_next("w1", token, now, now + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        assert!(repo.find_stalled(now, 10).await.unwrap().is_empty());
        assert!(!repo.save_if_stalled(&leased, token, now).await.unwrap());

        let later = now + Duration::seconds(31);
        assert_eq!(repo.find_stalled(later, 10).await.unwrap().len(), 1);
        assert!(repo.save_if_stalled(&leased, token, later).await.unwrap());
    }

    #[tokio::test]
    async fn prune_applies_age_and_count_windows() {
        let repo = InMemoryJobRepository::new();
        let now = Utc::now();
        for (i, state) in [
            JobState::Completed,
            JobState::Completed,
            JobState::Completed,
            JobState::Failed,
            JobState::Failed,
        ]
        .into_iter()
        .enumerate()
        {
            let mut j = job(&format!("s{}", i));
            j.state = state;
            j.finished_at = Some(now - Duration::hours(i as i64));
            repo.insert_if_absent(&j).await.unwrap();
        }
        let mut waiting = job("waiting");
        waiting.created_at = now - Duration::days(30);
        repo.insert_if_absent(&waiting).await.unwrap();

        // keep the two newest completed, drop failed jobs older than 3.5h
        let removed = repo
            .prune(now - Duration::days(1), 2, now - Duration::minutes(210))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        let remaining: Vec<String> = repo
            .all()
            .await
            .into_iter()
            .map(|j| j.source_session_id().to_string())
            .collect();
        assert!(remaining.contains(&"s0".to_string()));
        assert!(remaining.contains(&"s1".to_string()));
        assert!(remaining.contains(&"s3".to_string()));
        assert!(remaining.contains(&"waiting".to_string()));
    }
}
