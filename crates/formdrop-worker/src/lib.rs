//! Upload job queue and worker pool
//!
//! [`JobQueue`] owns job state transitions (lease, complete, retry with
//! exponential backoff, stalled-lease recovery and retention) on top of a
//! [`formdrop_db::JobRepository`]. [`WorkerPool`] leases jobs and runs them
//! through a [`JobHandler`]; [`UploadJobProcessor`] is the handler that moves
//! staged bytes into durable storage and records them on the submission.

pub mod classify;
pub mod error;
pub mod handoff;
pub mod policy;
pub mod pool;
pub mod processor;
pub mod queue;

pub use error::QueueError;
pub use handoff::EnqueueUploadJob;
pub use policy::RetryPolicy;
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use processor::{JobHandler, UploadJobProcessor};
pub use queue::{JobFailure, JobQueue, LeasedJob, STALLED_REASON};
