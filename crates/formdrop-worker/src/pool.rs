//! Worker pool: leases jobs, runs them on a bounded number of tasks, keeps
//! leases alive and runs the stalled-job and retention timers.
//!
//! New jobs are discovered through the in-process notifier, PostgreSQL
//! LISTEN/NOTIFY when a pool is supplied, and polling as a fallback.
//!
//! Shutdown: cancelling the token stops leasing and the timers. The pool then
//! waits for in-flight jobs before its task finishes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use formdrop_core::models::UploadErrorCode;
use formdrop_core::Config;
use formdrop_db::NEW_JOB_CHANNEL;
use sqlx::PgPool;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::QueueError;
use crate::processor::JobHandler;
use crate::queue::{JobFailure, JobQueue, LeasedJob};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub stalled_check_interval: Duration,
    /// Zero disables retention pruning.
    pub retention_interval: Duration,
    /// Upper bound on a single attempt, separate from the retry backoff.
    pub job_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(1000),
            stalled_check_interval: Duration::from_secs(30),
            retention_interval: Duration::from_secs(3600),
            job_timeout: Duration::from_secs(600),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.job_queue_workers(),
            poll_interval: config.job_poll_interval(),
            stalled_check_interval: config.job_stalled_check_interval(),
            retention_interval: Duration::from_secs(config.job_retention_interval_secs()),
            job_timeout: config.job_timeout(),
        }
    }
}

pub struct WorkerPool {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    config: WorkerPoolConfig,
    listen_pool: Option<PgPool>,
    worker_id: String,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>, config: WorkerPoolConfig) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".to_string());
        let worker_id = format!("{}-{}", host, &Uuid::new_v4().simple().to_string()[..8]);
        Self {
            queue,
            handler,
            config,
            listen_pool: None,
            worker_id,
        }
    }

    /// Wake on `pg_notify` from other processes in addition to polling.
    pub fn with_listener(mut self, pool: PgPool) -> Self {
        self.listen_pool = Some(pool);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            worker_id = %self.worker_id,
            workers = self.config.workers,
            listen = self.listen_pool.is_some(),
            "Upload worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let notify = self.queue.notifier();

        let mut timers = Vec::new();
        if !self.config.stalled_check_interval.is_zero() {
            timers.push(spawn_stalled_checker(
                self.queue.clone(),
                self.config.stalled_check_interval,
                cancel.clone(),
            ));
        }
        if !self.config.retention_interval.is_zero() {
            timers.push(spawn_pruner(
                self.queue.clone(),
                self.config.retention_interval,
                cancel.clone(),
            ));
        }
        if let Some(pool) = self.listen_pool.clone() {
            timers.push(spawn_listener(pool, notify.clone(), cancel.clone()));
        }

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.lease(&self.worker_id).await {
                Ok(Some(leased)) => {
                    let queue = self.queue.clone();
                    let handler = self.handler.clone();
                    let job_timeout = self.config.job_timeout;
                    tokio::spawn(async move {
                        let _permit = permit;
                        process_leased(&queue, handler.as_ref(), leased, job_timeout).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    let wait = self.queue.idle_wait(self.config.poll_interval).await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = notify.notified() => {}
                        _ = sleep(wait) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to lease upload job");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!("Upload worker pool draining in-flight jobs");
        let _ = semaphore.acquire_many(self.config.workers as u32).await;
        for timer in timers {
            let _ = timer.await;
        }
        tracing::info!("Upload worker pool stopped");
    }
}

/// Run one attempt of a leased job and record its outcome.
///
/// The lease is renewed every third of its duration. If a renewal reports the
/// lease lost, the attempt is dropped and nothing is recorded by this worker.
#[tracing::instrument(skip_all, fields(job_id = %leased.id(), attempt = leased.job.attempts_made + 1))]
pub(crate) async fn process_leased(
    queue: &JobQueue,
    handler: &dyn JobHandler,
    leased: LeasedJob,
    job_timeout: Duration,
) {
    let lease_lost = CancellationToken::new();
    let heartbeat = spawn_heartbeat(queue.clone(), leased.clone(), lease_lost.clone());
    let start = Instant::now();

    let outcome = tokio::select! {
        _ = lease_lost.cancelled() => None,
        result = tokio::time::timeout(job_timeout, handler.handle(&leased.job)) => Some(result),
    };
    heartbeat.abort();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let Some(outcome) = outcome else {
        tracing::warn!("Lease lost while processing, abandoning attempt");
        return;
    };

    let recorded = match outcome {
        Ok(Ok(mut result)) => {
            result.processing_time = Some(elapsed_ms);
            queue.complete(&leased, result).await.map(|_| ())
        }
        Ok(Err(err)) => {
            tracing::warn!(
                error = %format!("{:#}", err.inner()),
                recoverable = err.is_recoverable(),
                error_code = %err.code(),
                "Upload attempt failed"
            );
            queue
                .fail(&leased, &JobFailure::from_job_error(&err, elapsed_ms))
                .await
                .map(|_| ())
        }
        Err(_) => {
            let failure = JobFailure {
                message: format!("job timed out after {}s", job_timeout.as_secs_f64()),
                code: UploadErrorCode::NetworkTimeout,
                permanent: false,
                processing_time_ms: elapsed_ms,
            };
            queue.fail(&leased, &failure).await.map(|_| ())
        }
    };

    match recorded {
        Ok(()) => {}
        Err(QueueError::LeaseLost(_)) => {
            tracing::warn!("Lease lost before the outcome could be recorded");
        }
        Err(e) => tracing::error!(error = %e, "Failed to record job outcome"),
    }
}

fn spawn_heartbeat(queue: JobQueue, leased: LeasedJob, lost: CancellationToken) -> JoinHandle<()> {
    let every = queue.policy().heartbeat_interval();
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match queue.heartbeat(&leased).await {
                Ok(true) => {}
                Ok(false) => {
                    lost.cancel();
                    break;
                }
                Err(e) => tracing::warn!(error = %e, job_id = %leased.id(), "Lease renewal failed"),
            }
        }
    })
}

fn spawn_stalled_checker(
    queue: JobQueue,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = queue.reclaim_stalled(Utc::now()).await {
                        tracing::error!(error = %e, "Stalled job check failed");
                    }
                }
            }
        }
    })
}

fn spawn_pruner(queue: JobQueue, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = queue.prune(Utc::now()).await {
                        tracing::error!(error = %e, "Upload job retention pass failed");
                    }
                }
            }
        }
    })
}

fn spawn_listener(pool: PgPool, notify: Arc<Notify>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut listener = match sqlx::postgres::PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::warn!(error = %e, "PgListener connect failed, will retry");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };
            if let Err(e) = listener.listen(NEW_JOB_CHANNEL).await {
                tracing::warn!(error = %e, "LISTEN failed, will retry");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(Duration::from_secs(5)) => continue,
                }
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = listener.recv() => match received {
                        Ok(_) => notify.notify_one(),
                        Err(e) => {
                            tracing::warn!(error = %e, "LISTEN connection lost, reconnecting");
                            break;
                        }
                    },
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RetryPolicy;
    use crate::processor::UploadJobProcessor;
    use async_trait::async_trait;
    use bytes::Bytes;
    use formdrop_core::models::{JobState, UploadJob, UploadJobPayload, UploadResult};
    use formdrop_core::JobError;
    use formdrop_db::{InMemoryJobRepository, InMemorySubmissionRepository};
    use formdrop_storage::{
        ByteStream, MemoryStorage, StagingArea, Storage, StorageBackend, StorageError,
        StorageResult,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SESSION: &str = "00112233445566778899aabbccddeeff";

    /// Memory storage whose first `failures` writes under `uploads/` fail.
    struct FlakyStorage {
        inner: MemoryStorage,
        failures: usize,
        error: fn() -> StorageError,
        puts: AtomicUsize,
    }

    impl FlakyStorage {
        fn check(&self, key: &str) -> StorageResult<()> {
            if key.starts_with("uploads/") {
                let attempt = self.puts.fetch_add(1, Ordering::SeqCst);
                if attempt < self.failures {
                    return Err((self.error)());
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String> {
            self.check(key)?;
            self.inner.put(key, data, content_type).await
        }

        async fn put_stream(
            &self,
            key: &str,
            content_type: &str,
            content_length: u64,
            stream: ByteStream,
        ) -> StorageResult<String> {
            self.check(key)?;
            self.inner
                .put_stream(key, content_type, content_length, stream)
                .await
        }

        async fn get(&self, key: &str) -> StorageResult<Bytes> {
            self.inner.get(key).await
        }

        async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
            self.inner.get_stream(key).await
        }

        async fn content_length(&self, key: &str) -> StorageResult<u64> {
            self.inner.content_length(key).await
        }

        async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
            self.inner.signed_url(key, expires_in).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
            self.inner.list(prefix).await
        }

        async fn exists(&self, key: &str) -> StorageResult<bool> {
            self.inner.exists(key).await
        }

        fn backend_type(&self) -> StorageBackend {
            StorageBackend::Memory
        }
    }

    struct NeverFinishes;

    #[async_trait]
    impl JobHandler for NeverFinishes {
        async fn handle(&self, _job: &UploadJob) -> Result<UploadResult, JobError> {
            std::future::pending().await
        }
    }

    fn payload() -> UploadJobPayload {
        UploadJobPayload {
            tus_upload_id: SESSION.to_string(),
            file_name: "photo.png".to_string(),
            file_size: 4,
            content_type: "image/png".to_string(),
            form_id: "gallery".to_string(),
            submission_id: None,
            field_key: "photo".to_string(),
            user_id: None,
            metadata: None,
            uploaded_at: Utc::now(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            backoff_base: Duration::from_millis(10),
            lease: Duration::from_millis(300),
            ..Default::default()
        }
    }

    fn fast_pool_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: 2,
            poll_interval: Duration::from_millis(10),
            stalled_check_interval: Duration::from_millis(20),
            retention_interval: Duration::from_secs(3600),
            job_timeout: Duration::from_secs(5),
        }
    }

    async fn staged(failures: usize, error: fn() -> StorageError) -> Arc<FlakyStorage> {
        let inner = MemoryStorage::new();
        StagingArea::new(Arc::new(inner.clone()))
            .write_chunk(SESSION, 0, Bytes::from_static(b"\x89PNG"))
            .await
            .unwrap();
        Arc::new(FlakyStorage {
            inner,
            failures,
            error,
            puts: AtomicUsize::new(0),
        })
    }

    fn processor(storage: Arc<FlakyStorage>) -> Arc<dyn JobHandler> {
        Arc::new(UploadJobProcessor::new(
            storage,
            Arc::new(InMemorySubmissionRepository::new()),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ))
    }

    async fn wait_finished(queue: &JobQueue, id: Uuid) -> UploadJob {
        for _ in 0..500 {
            if let Some(job) = queue.get(id).await.unwrap() {
                if job.state.is_finished() {
                    return job;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn transient_failures_then_success() {
        let storage = staged(2, || {
            StorageError::Unavailable("connect ECONNREFUSED 127.0.0.1:9000".to_string())
        })
        .await;
        let queue = JobQueue::new(Arc::new(InMemoryJobRepository::new()), fast_policy());
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(queue.clone(), processor(storage.clone()), fast_pool_config())
            .spawn(cancel.clone());

        let job = queue.enqueue(payload()).await.unwrap();
        let done = wait_finished(&queue, job.id).await;

        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts_made, 3);
        let result = done.result.unwrap();
        assert!(result.success);
        assert_eq!(result.retry_count, Some(2));
        assert_eq!(
            result.storage_key.as_deref(),
            Some("uploads/gallery/00112233445566778899aabbccddeeff/photo.png")
        );
        assert_eq!(storage.puts.load(Ordering::SeqCst), 3);

        cancel.cancel();
        pool.await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_storage_fails_after_one_attempt() {
        let storage = staged(usize::MAX, || {
            StorageError::Unauthorized("401 Unauthorized".to_string())
        })
        .await;
        let queue = JobQueue::new(Arc::new(InMemoryJobRepository::new()), fast_policy());
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(queue.clone(), processor(storage.clone()), fast_pool_config())
            .spawn(cancel.clone());

        let job = queue.enqueue(payload()).await.unwrap();
        let done = wait_finished(&queue, job.id).await;

        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.attempts_made, 1);
        assert_eq!(
            done.result.as_ref().unwrap().error_code,
            Some(UploadErrorCode::PermissionDenied)
        );
        assert!(done.failed_reason().unwrap().contains("401"));

        cancel.cancel();
        pool.await.unwrap();
    }

    #[tokio::test]
    async fn crashed_worker_job_is_reclaimed_and_stored_once() {
        let storage = staged(0, || StorageError::BackendError(String::new())).await;
        let policy = RetryPolicy {
            lease: Duration::from_millis(50),
            ..fast_policy()
        };
        let queue = JobQueue::new(Arc::new(InMemoryJobRepository::new()), policy);
        let job = queue.enqueue(payload()).await.unwrap();

        // a worker leases the job and dies without heartbeating
        let crashed = queue.lease("crashed").await.unwrap().unwrap();

        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(queue.clone(), processor(storage.clone()), fast_pool_config())
            .spawn(cancel.clone());
        let done = wait_finished(&queue, job.id).await;

        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.stalled_count, 1);
        assert_eq!(storage.inner.list("uploads/").await.unwrap().len(), 1);
        assert_eq!(storage.puts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            queue.complete(&crashed, UploadResult::default()).await,
            Err(QueueError::LeaseLost(_))
        ));

        cancel.cancel();
        pool.await.unwrap();
    }

    #[tokio::test]
    async fn lost_lease_aborts_the_attempt() {
        let policy = RetryPolicy {
            lease: Duration::from_millis(60),
            ..fast_policy()
        };
        let queue = JobQueue::new(Arc::new(InMemoryJobRepository::new()), policy);
        queue.enqueue(payload()).await.unwrap();
        let leased = queue.lease("w1").await.unwrap().unwrap();

        let running = {
            let queue = queue.clone();
            let leased = leased.clone();
            tokio::spawn(async move {
                process_leased(&queue, &NeverFinishes, leased, Duration::from_secs(30)).await;
            })
        };

        // someone else records an outcome; the lease is gone
        queue
            .complete(&leased, UploadResult::default())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("attempt should stop once the lease is lost")
            .unwrap();
    }
}
