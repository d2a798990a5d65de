//! Repositories for the upload pipeline
//!
//! Each store is a trait with a PostgreSQL implementation (dynamic sqlx
//! queries) and an in-memory implementation. The in-memory variants back
//! `SESSION_STORE=memory` deployments and every test suite in the workspace.

pub mod job;
pub mod lock;
pub mod session;
pub mod submission;

use std::sync::Arc;

use sqlx::PgPool;

pub use job::{InMemoryJobRepository, JobRepository, PostgresJobRepository, NEW_JOB_CHANNEL};
pub use lock::{InMemorySessionLock, PostgresSessionLock, SessionLock};
pub use session::{InMemorySessionRepository, PostgresSessionRepository, SessionRepository};
pub use submission::{
    InMemorySubmissionRepository, PostgresSubmissionRepository, SubmissionRepository,
};

/// Every store used by the transfer server and the worker pool.
#[derive(Clone)]
pub struct Repositories {
    pub sessions: Arc<dyn SessionRepository>,
    pub locks: Arc<dyn SessionLock>,
    pub jobs: Arc<dyn JobRepository>,
    pub submissions: Arc<dyn SubmissionRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            sessions: Arc::new(PostgresSessionRepository::new(pool.clone())),
            locks: Arc::new(PostgresSessionLock::new(pool.clone())),
            jobs: Arc::new(PostgresJobRepository::new(pool.clone())),
            submissions: Arc::new(PostgresSubmissionRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(InMemorySessionRepository::new()),
            locks: Arc::new(InMemorySessionLock::new()),
            jobs: Arc::new(InMemoryJobRepository::new()),
            submissions: Arc::new(InMemorySubmissionRepository::new()),
        }
    }
}
