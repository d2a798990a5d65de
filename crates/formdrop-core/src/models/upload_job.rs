use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::upload_session::UploadSession;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready now, or delayed until `available_at` by the retry schedule.
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(anyhow::anyhow!("Invalid job state: {}", s)),
        }
    }
}

/// Job payload handed from the transfer server to the worker pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadJobPayload {
    pub tus_upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub form_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    pub field_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadJobPayload {
    pub fn from_session(session: &UploadSession, uploaded_at: DateTime<Utc>) -> Self {
        let meta = &session.metadata;
        let metadata = if meta.extra.is_empty() {
            None
        } else {
            serde_json::to_value(&meta.extra).ok()
        };
        Self {
            tus_upload_id: session.id.clone(),
            file_name: meta.filename.clone(),
            file_size: session.total_size,
            content_type: meta.content_type.clone(),
            form_id: meta.form_id.clone(),
            submission_id: meta.submission_id.clone(),
            field_key: meta.field_key.clone(),
            user_id: meta.owner_user_id.clone(),
            metadata,
            uploaded_at,
        }
    }

    /// Check the fields the worker cannot do without.
    pub fn validate(&self) -> Result<(), String> {
        if self.tus_upload_id.trim().is_empty() {
            return Err("tusUploadId is empty".to_string());
        }
        if self.file_name.trim().is_empty() {
            return Err("fileName is empty".to_string());
        }
        if self.form_id.trim().is_empty() {
            return Err("formId is empty".to_string());
        }
        if self.field_key.trim().is_empty() {
            return Err("fieldKey is empty".to_string());
        }
        Ok(())
    }
}

/// Exclusive, time-bounded claim held by one worker on one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobLease {
    pub owner: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadJob {
    pub id: Uuid,
    pub payload: UploadJobPayload,
    pub state: JobState,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub stalled_count: i32,
    /// Message of the most recent failure (`failedReason` once the job is failed).
    pub last_error: Option<String>,
    pub result: Option<UploadResult>,
    pub available_at: DateTime<Utc>,
    pub lease: Option<JobLease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl UploadJob {
    pub fn new(payload: UploadJobPayload, max_attempts: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts,
            stalled_count: 0,
            last_error: None,
            result: None,
            available_at: now,
            lease: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn source_session_id(&self) -> &str {
        &self.payload.tus_upload_id
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.available_at <= now
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active
            && self
                .lease
                .as_ref()
                .map_or(true, |lease| lease.expires_at < now)
    }

    /// Whether `token` identifies the lease currently held on this job.
    pub fn is_leased_by(&self, token: Uuid) -> bool {
        self.state == JobState::Active && self.lease.as_ref().is_some_and(|l| l.token == token)
    }

    /// Whether one more failed attempt still leaves room for a retry.
    pub fn can_retry_after_failure(&self) -> bool {
        self.attempts_made + 1 < self.max_attempts
    }

    /// `failedReason` for dead-lettered jobs.
    pub fn failed_reason(&self) -> Option<&str> {
        if self.state == JobState::Failed {
            self.last_error.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UploadErrorCode {
    StorageUploadFailed,
    NetworkTimeout,
    InvalidFile,
    PermissionDenied,
}

impl Display for UploadErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UploadErrorCode::StorageUploadFailed => write!(f, "StorageUploadFailed"),
            UploadErrorCode::NetworkTimeout => write!(f, "NetworkTimeout"),
            UploadErrorCode::InvalidFile => write!(f, "InvalidFile"),
            UploadErrorCode::PermissionDenied => write!(f, "PermissionDenied"),
        }
    }
}

/// Result attached to a job once it reaches a terminal state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<UploadErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i32>,
    /// Milliseconds spent in the attempt that produced this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<u64>,
}

impl UploadResult {
    pub fn failure(
        error: impl Into<String>,
        code: UploadErrorCode,
        retry_count: i32,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_code: Some(code),
            retry_count: Some(retry_count),
            processing_time: Some(processing_time_ms),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> UploadJobPayload {
        UploadJobPayload {
            tus_upload_id: "abc".to_string(),
            file_name: "a.pdf".to_string(),
            file_size: 10,
            content_type: "application/pdf".to_string(),
            form_id: "form".to_string(),
            submission_id: None,
            field_key: "file".to_string(),
            user_id: None,
            metadata: None,
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let json = serde_json::to_value(payload()).unwrap();
        assert_eq!(json["tusUploadId"], "abc");
        assert_eq!(json["fileSize"], 10);
        assert_eq!(json["fieldKey"], "file");
        assert!(json.get("submissionId").is_none());
    }

    #[test]
    fn payload_validation_requires_field_key() {
        let mut p = payload();
        p.field_key = " ".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn retry_budget() {
        let mut job = UploadJob::new(payload(), 5, Utc::now());
        job.attempts_made = 3;
        assert!(job.can_retry_after_failure());
        job.attempts_made = 4;
        assert!(!job.can_retry_after_failure());
    }

    #[test]
    fn result_serializes_error_code() {
        let result = UploadResult::failure("denied", UploadErrorCode::PermissionDenied, 0, 12);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["errorCode"], "PermissionDenied");
        assert_eq!(json["processingTime"], 12);
        assert!(json.get("storageUrl").is_none());
    }
}
