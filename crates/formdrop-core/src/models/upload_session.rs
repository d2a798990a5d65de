use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a resumable transfer session.
///
/// ```text
/// created --(first accepted append)--> uploading --(offset reaches size)--> completed
/// created|uploading --(expiry sweep)--> expired
/// created|uploading --(terminate)--> terminated
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Uploading,
    Completed,
    Expired,
    Terminated,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Expired | SessionStatus::Terminated
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `uploading -> uploading` is allowed so every accepted append can be written
    /// with the same guarded update.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Uploading)
                | (Created, Completed)
                | (Uploading, Uploading)
                | (Uploading, Completed)
                | (Created, Expired)
                | (Uploading, Expired)
                | (Created, Terminated)
                | (Uploading, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
            SessionStatus::Terminated => "terminated",
        }
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(SessionStatus::Created),
            "uploading" => Ok(SessionStatus::Uploading),
            "completed" => Ok(SessionStatus::Completed),
            "expired" => Ok(SessionStatus::Expired),
            "terminated" => Ok(SessionStatus::Terminated),
            _ => Err(anyhow::anyhow!("Invalid session status: {}", s)),
        }
    }
}

/// Metadata captured at session creation and carried into the upload job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub filename: String,
    pub content_type: String,
    pub form_id: String,
    pub field_key: String,
    pub owner_user_id: Option<String>,
    pub submission_id: Option<String>,
    /// Any extra `Upload-Metadata` pairs, forwarded to the job as-is.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub total_size: u64,
    pub bytes_received: u64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: SessionMetadata,
}

impl UploadSession {
    /// Build a fresh `created` session with a new opaque id.
    pub fn new(
        total_size: u64,
        metadata: SessionMetadata,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: new_session_id(),
            total_size,
            bytes_received: 0,
            status: SessionStatus::Created,
            created_at: now,
            expires_at: now + ttl,
            metadata,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SessionStatus::Expired => true,
            SessionStatus::Created | SessionStatus::Uploading => self.expires_at < now,
            _ => false,
        }
    }

    /// Bytes still expected before the session completes.
    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.bytes_received)
    }
}

/// Opaque session token: 32 lowercase hex characters.
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Session ids are generated by [`new_session_id`]; anything else is rejected
/// before touching the store.
pub fn is_valid_session_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            filename: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            form_id: "form-1".to_string(),
            field_key: "attachment".to_string(),
            owner_user_id: None,
            submission_id: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn terminal_states_do_not_transition() {
        for terminal in [
            SessionStatus::Completed,
            SessionStatus::Expired,
            SessionStatus::Terminated,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                SessionStatus::Created,
                SessionStatus::Uploading,
                SessionStatus::Completed,
                SessionStatus::Expired,
                SessionStatus::Terminated,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn forward_transitions_only() {
        assert!(SessionStatus::Created.can_transition_to(SessionStatus::Uploading));
        assert!(SessionStatus::Uploading.can_transition_to(SessionStatus::Completed));
        assert!(!SessionStatus::Uploading.can_transition_to(SessionStatus::Created));
    }

    #[test]
    fn new_session_starts_created_with_ttl() {
        let now = Utc::now();
        let session = UploadSession::new(1024, metadata(), now, chrono::Duration::hours(24));
        assert_eq!(session.status, SessionStatus::Created);
        assert_eq!(session.bytes_received, 0);
        assert_eq!(session.expires_at, now + chrono::Duration::hours(24));
        assert!(is_valid_session_id(&session.id));
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + chrono::Duration::hours(25)));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(!is_valid_session_id("../etc/passwd"));
        assert!(!is_valid_session_id(""));
        assert!(is_valid_session_id(&new_session_id()));
    }
}
