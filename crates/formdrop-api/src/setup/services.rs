//! Service wiring: transfer server, job queue, worker pool and sweeper.

use std::sync::Arc;

use formdrop_core::{Config, HookRegistry};
use formdrop_db::Repositories;
use formdrop_storage::{StagingArea, Storage};
use formdrop_transfer::{ResumableTransferServer, SessionSweeper, TransferSettings};
use formdrop_worker::{
    EnqueueUploadJob, JobQueue, RetryPolicy, UploadJobProcessor, WorkerPool, WorkerPoolConfig,
};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

pub struct Services {
    pub state: Arc<AppState>,
    pub background: BackgroundServices,
}

/// Long-running tasks, built but not yet started.
pub struct BackgroundServices {
    sweeper: Option<SessionSweeper>,
    workers: WorkerPool,
}

/// Handles to started background tasks.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Build every service on top of `repositories` and `storage`.
///
/// `hooks` may carry caller-supplied on-create and on-complete hooks; the
/// job-enqueue hook is appended after them.
pub fn initialize_services(
    config: &Config,
    repositories: Repositories,
    storage: Arc<dyn Storage>,
    pool: Option<PgPool>,
    hooks: HookRegistry,
) -> Services {
    let queue = JobQueue::new(repositories.jobs.clone(), RetryPolicy::from_config(config));

    let hooks = hooks.with_on_complete(Arc::new(EnqueueUploadJob::new(queue.clone())));
    let transfer = ResumableTransferServer::new(
        repositories.sessions.clone(),
        repositories.locks.clone(),
        StagingArea::new(storage.clone()),
        hooks,
        config.upload_policy(),
        TransferSettings::from_config(config),
    );

    let processor =
        UploadJobProcessor::from_config(storage.clone(), repositories.submissions.clone(), config);
    let mut workers = WorkerPool::new(
        queue.clone(),
        Arc::new(processor),
        WorkerPoolConfig::from_config(config),
    );
    if let Some(pool) = &pool {
        workers = workers.with_listener(pool.clone());
    }

    let sweep_interval = config.upload_sweep_interval();
    let sweeper = if sweep_interval.is_zero() {
        tracing::warn!("UPLOAD_SWEEP_INTERVAL_SECS is 0, expired sessions will not be reclaimed");
        None
    } else {
        Some(SessionSweeper::new(transfer.clone(), sweep_interval))
    };

    let state = Arc::new(AppState {
        config: config.clone(),
        transfer,
        queue,
        storage,
        pool,
    });

    Services {
        state,
        background: BackgroundServices { sweeper, workers },
    }
}

impl BackgroundServices {
    pub fn start(self) -> BackgroundTasks {
        let cancel = CancellationToken::new();
        let mut handles = vec![self.workers.spawn(cancel.clone())];
        if let Some(sweeper) = self.sweeper {
            handles.push(sweeper.spawn(cancel.clone()));
        }
        BackgroundTasks { cancel, handles }
    }
}

impl BackgroundTasks {
    /// Stop leasing and sweeping, then wait for in-flight jobs.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Background tasks stopped");
    }
}
