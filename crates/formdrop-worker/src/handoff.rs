use async_trait::async_trait;
use chrono::Utc;
use formdrop_core::models::{UploadJobPayload, UploadSession};
use formdrop_core::OnCompleteHook;

use crate::queue::JobQueue;

/// On-complete hook that turns a finished session into an upload job.
///
/// Enqueueing is idempotent per session id, so a handoff retried by the
/// session sweep never produces a second job.
#[derive(Clone)]
pub struct EnqueueUploadJob {
    queue: JobQueue,
}

impl EnqueueUploadJob {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl OnCompleteHook for EnqueueUploadJob {
    fn name(&self) -> &'static str {
        "enqueue_upload_job"
    }

    async fn on_complete(&self, session: &UploadSession) -> anyhow::Result<()> {
        let payload = UploadJobPayload::from_session(session, Utc::now());
        let job = self.queue.enqueue(payload).await?;
        tracing::debug!(job_id = %job.id, session_id = %session.id, "Session handed off");
        Ok(())
    }
}
