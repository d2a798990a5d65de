//! Resumable transfer session state machine.
//!
//! ```text
//! created --(first accepted append)--> uploading --(offset == size)--> completed
//! created|uploading --(expiry sweep)--> expired
//! created|uploading --(terminate)--> terminated
//! ```
//!
//! Appends to one session are serialized through a [`SessionLock`] claim with
//! a fresh owner token per request. Offsets are advanced with a compare-and-set
//! on the stored offset, so the move to `completed` (and therefore the
//! completion handoff) happens once per session.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use formdrop_core::models::{is_valid_session_id, SessionStatus, UploadSession};
use formdrop_core::validation::parse_upload_metadata;
use formdrop_core::{AppError, AuthContext, Config, HookRegistry, UploadPolicy};
use formdrop_db::{SessionLock, SessionRepository};
use formdrop_storage::StagingArea;
use uuid::Uuid;

use crate::error::TransferError;

/// Tunables for the transfer server.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub max_chunk_size: u64,
    pub session_ttl: Duration,
    pub lock_ttl: Duration,
    /// Sessions examined per sweep query
    pub sweep_batch_size: i64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: 64 * 1024 * 1024,
            session_ttl: Duration::from_secs(86400),
            lock_ttl: Duration::from_secs(300),
            sweep_batch_size: 500,
        }
    }
}

impl TransferSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_chunk_size: config.upload_max_chunk_size_bytes(),
            session_ttl: config.upload_session_ttl(),
            lock_ttl: config.upload_lock_ttl(),
            ..Default::default()
        }
    }
}

/// Progress of a live session, as reported by `HEAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProgress {
    pub id: String,
    pub bytes_received: u64,
    pub total_size: u64,
    pub expires_at: DateTime<Utc>,
}

impl From<&UploadSession> for SessionProgress {
    fn from(session: &UploadSession) -> Self {
        Self {
            id: session.id.clone(),
            bytes_received: session.bytes_received,
            total_size: session.total_size,
            expires_at: session.expires_at,
        }
    }
}

/// Outcome of an accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub offset: u64,
    pub expires_at: DateTime<Utc>,
    pub completed: bool,
}

/// What one sweep pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired sessions removed together with their staged bytes
    pub expired: usize,
    /// Completed sessions whose pending handoff succeeded on this pass
    pub handed_off: usize,
}

#[derive(Clone)]
pub struct ResumableTransferServer {
    sessions: Arc<dyn SessionRepository>,
    locks: Arc<dyn SessionLock>,
    staging: StagingArea,
    hooks: HookRegistry,
    policy: UploadPolicy,
    settings: TransferSettings,
}

impl ResumableTransferServer {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        locks: Arc<dyn SessionLock>,
        staging: StagingArea,
        hooks: HookRegistry,
        policy: UploadPolicy,
        settings: TransferSettings,
    ) -> Self {
        Self {
            sessions,
            locks,
            staging,
            hooks,
            policy,
            settings,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Create a session for an upload of `upload_length` bytes.
    ///
    /// A zero-length upload is complete on creation and handed off immediately.
    #[tracing::instrument(skip(self, metadata_header, auth))]
    pub async fn create(
        &self,
        upload_length: u64,
        metadata_header: &str,
        auth: &AuthContext,
    ) -> Result<UploadSession, TransferError> {
        self.policy.check_size(upload_length)?;
        let pairs = parse_upload_metadata(metadata_header)?;
        let metadata = self.policy.session_metadata(pairs, auth)?;

        let ttl = chrono::Duration::from_std(self.settings.session_ttl)
            .map_err(|e| AppError::Internal(format!("Invalid session TTL: {}", e)))?;
        let session = UploadSession::new(upload_length, metadata, Utc::now(), ttl);

        self.hooks.run_on_create(&session, auth).await?;
        self.sessions.insert(&session).await?;

        tracing::info!(
            session_id = %session.id,
            total_size = session.total_size,
            form_id = %session.metadata.form_id,
            field_key = %session.metadata.field_key,
            "Upload session created"
        );

        if upload_length == 0 {
            if let Some(completed) = self
                .sessions
                .advance(&session.id, 0, 0, SessionStatus::Completed)
                .await?
            {
                self.hand_off(&completed).await;
                return Ok(completed);
            }
        }

        Ok(session)
    }

    /// Current offset of a live session.
    pub async fn status(&self, id: &str) -> Result<SessionProgress, TransferError> {
        let session = self.live_session(id, Utc::now()).await?;
        Ok(SessionProgress::from(&session))
    }

    /// Append `data` at `offset`.
    ///
    /// Rejections never mutate the session, so a client may retry any failed
    /// request after re-reading the offset.
    #[tracing::instrument(skip(self, data), fields(session_id = %id, chunk_bytes = data.len()))]
    pub async fn append_chunk(
        &self,
        id: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<AppendOutcome, TransferError> {
        if !is_valid_session_id(id) {
            return Err(TransferError::NotFound(id.to_string()));
        }
        let len = data.len() as u64;
        if len > self.settings.max_chunk_size {
            return Err(TransferError::ChunkTooLarge {
                len,
                max: self.settings.max_chunk_size,
            });
        }

        let owner = Uuid::new_v4().to_string();
        if !self
            .locks
            .try_claim(id, &owner, self.settings.lock_ttl)
            .await?
        {
            return Err(TransferError::Locked(id.to_string()));
        }

        let result = self.append_claimed(id, offset, data).await;

        if let Err(e) = self.locks.release(id, &owner).await {
            tracing::warn!(error = %e, session_id = %id, "Failed to release session claim");
        }

        result
    }

    async fn append_claimed(
        &self,
        id: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<AppendOutcome, TransferError> {
        let now = Utc::now();
        let session = self.live_session(id, now).await?;
        let len = data.len() as u64;

        if offset != session.bytes_received {
            return Err(TransferError::OffsetMismatch {
                expected: session.bytes_received,
                actual: offset,
            });
        }
        if len > session.remaining() {
            return Err(TransferError::ChunkOverrun {
                offset,
                len,
                total: session.total_size,
            });
        }
        if len == 0 {
            return Ok(AppendOutcome {
                offset,
                expires_at: session.expires_at,
                completed: session.status == SessionStatus::Completed,
            });
        }

        self.staging.write_chunk(id, offset, data).await?;

        let new_offset = offset + len;
        let next_status = if new_offset == session.total_size {
            SessionStatus::Completed
        } else {
            SessionStatus::Uploading
        };

        let Some(updated) = self
            .sessions
            .advance(id, offset, new_offset, next_status)
            .await?
        else {
            // Only reachable if our claim lapsed and another request advanced the session.
            let current = self.live_session(id, now).await?;
            return Err(TransferError::OffsetMismatch {
                expected: current.bytes_received,
                actual: offset,
            });
        };

        tracing::debug!(
            session_id = %id,
            offset = new_offset,
            total_size = updated.total_size,
            "Chunk accepted"
        );

        let completed = updated.status == SessionStatus::Completed;
        if completed {
            tracing::info!(
                session_id = %id,
                total_size = updated.total_size,
                "Upload session completed"
            );
            self.hand_off(&updated).await;
        }

        Ok(AppendOutcome {
            offset: updated.bytes_received,
            expires_at: updated.expires_at,
            completed,
        })
    }

    /// Terminate a session that is still receiving bytes and discard its staged data.
    #[tracing::instrument(skip(self))]
    pub async fn terminate(&self, id: &str) -> Result<(), TransferError> {
        if !is_valid_session_id(id) {
            return Err(TransferError::NotFound(id.to_string()));
        }

        let owner = Uuid::new_v4().to_string();
        if !self
            .locks
            .try_claim(id, &owner, self.settings.lock_ttl)
            .await?
        {
            return Err(TransferError::Locked(id.to_string()));
        }

        let result = self.terminate_claimed(id).await;

        if let Err(e) = self.locks.release(id, &owner).await {
            tracing::warn!(error = %e, session_id = %id, "Failed to release session claim");
        }

        result
    }

    async fn terminate_claimed(&self, id: &str) -> Result<(), TransferError> {
        let session = self.live_session(id, Utc::now()).await?;
        if session.status == SessionStatus::Completed {
            return Err(TransferError::HandoffPending(id.to_string()));
        }

        let removed = self.staging.delete_all(id).await?;
        if !self.sessions.finish(id, SessionStatus::Terminated).await? {
            return Err(TransferError::NotFound(id.to_string()));
        }
        self.sessions.delete(id).await?;

        tracing::info!(session_id = %id, chunks_removed = removed, "Upload session terminated");
        Ok(())
    }

    /// Reclaim expired sessions and retry handoff of completed ones.
    ///
    /// Sessions claimed by an in-flight request are skipped until the next pass.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, TransferError> {
        let mut report = SweepReport::default();
        let owner = format!("sweeper-{}", Uuid::new_v4());

        for session in self
            .sessions
            .find_expired(now, self.settings.sweep_batch_size)
            .await?
        {
            if !self
                .locks
                .try_claim(&session.id, &owner, self.settings.lock_ttl)
                .await?
            {
                continue;
            }
            match self.expire_claimed(&session).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, session_id = %session.id, "Failed to expire session")
                }
            }
            if let Err(e) = self.locks.release(&session.id, &owner).await {
                tracing::warn!(error = %e, session_id = %session.id, "Failed to release session claim");
            }
        }

        for session in self
            .sessions
            .find_completed(self.settings.sweep_batch_size)
            .await?
        {
            if !self
                .locks
                .try_claim(&session.id, &owner, self.settings.lock_ttl)
                .await?
            {
                continue;
            }
            if self.hand_off(&session).await {
                report.handed_off += 1;
            }
            if let Err(e) = self.locks.release(&session.id, &owner).await {
                tracing::warn!(error = %e, session_id = %session.id, "Failed to release session claim");
            }
        }

        if report.expired > 0 || report.handed_off > 0 {
            tracing::info!(
                expired = report.expired,
                handed_off = report.handed_off,
                "Upload session sweep finished"
            );
        }

        Ok(report)
    }

    async fn expire_claimed(&self, session: &UploadSession) -> Result<bool, TransferError> {
        // Staging goes first; if it fails the session is still found by the next sweep.
        self.staging.delete_all(&session.id).await?;
        if !self
            .sessions
            .finish(&session.id, SessionStatus::Expired)
            .await?
        {
            return Ok(false);
        }
        self.sessions.delete(&session.id).await?;
        tracing::debug!(session_id = %session.id, "Expired upload session removed");
        Ok(true)
    }

    /// Run the on-complete hooks and drop the session row once they all succeed.
    ///
    /// A row left behind is handed off again by the sweep, which is why
    /// [`OnCompleteHook`](formdrop_core::OnCompleteHook) implementations must be idempotent.
    async fn hand_off(&self, session: &UploadSession) -> bool {
        if let Err(e) = self.hooks.run_on_complete(session).await {
            tracing::warn!(
                error = %format!("{:#}", e),
                session_id = %session.id,
                "Upload handoff failed, will retry on next sweep"
            );
            return false;
        }

        match self.sessions.delete(&session.id).await {
            Ok(_) => {
                tracing::info!(session_id = %session.id, "Upload handed off");
                true
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    session_id = %session.id,
                    "Handoff succeeded but session row was not removed"
                );
                false
            }
        }
    }

    /// Load a session that a client may still address: known, not expired,
    /// and not in a removed terminal state.
    async fn live_session(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<UploadSession, TransferError> {
        if !is_valid_session_id(id) {
            return Err(TransferError::NotFound(id.to_string()));
        }
        match self.sessions.get(id).await? {
            Some(session)
                if !session.is_expired(now)
                    && session.status != SessionStatus::Terminated =>
            {
                Ok(session)
            }
            _ => Err(TransferError::NotFound(id.to_string())),
        }
    }
}
