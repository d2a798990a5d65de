use formdrop_core::AppError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The worker's lease was reclaimed or the job already finished.
    #[error("Lease on job {0} is no longer held")]
    LeaseLost(Uuid),

    #[error(transparent)]
    Repository(#[from] AppError),
}
