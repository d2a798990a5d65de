use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use formdrop_core::models::{SessionMetadata, SessionStatus, UploadSession};
use formdrop_core::AppError;
use sqlx::PgPool;
use tokio::sync::RwLock;

/// Persistent table of transfer sessions keyed by session id.
///
/// Mutations are guarded compare-and-set updates so that two server instances
/// sharing the store can never move a session backwards or past a terminal state.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(&self, session: &UploadSession) -> Result<(), AppError>;

    async fn get(&self, id: &str) -> Result<Option<UploadSession>, AppError>;

    /// Move `bytes_received` from `expected_offset` to `new_offset` and set `status`.
    ///
    /// Applies only while the stored offset still equals `expected_offset` and
    /// the stored status may transition to `status`. Returns the updated session,
    /// or `None` when the guard did not match.
    async fn advance(
        &self,
        id: &str,
        expected_offset: u64,
        new_offset: u64,
        status: SessionStatus,
    ) -> Result<Option<UploadSession>, AppError>;

    /// Move a non-terminal session to a terminal `status`. Returns false if it
    /// was already terminal or does not exist.
    async fn finish(&self, id: &str, status: SessionStatus) -> Result<bool, AppError>;

    async fn delete(&self, id: &str) -> Result<bool, AppError>;

    /// `created`/`uploading` sessions whose `expires_at` is before `now`
    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UploadSession>, AppError>;

    /// Completed sessions still in the store, i.e. whose handoff has not succeeded yet
    async fn find_completed(&self, limit: i64) -> Result<Vec<UploadSession>, AppError>;
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    total_size: i64,
    bytes_received: i64,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    metadata: serde_json::Value,
}

impl TryFrom<SessionRow> for UploadSession {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<SessionStatus>()
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let metadata: SessionMetadata = serde_json::from_value(row.metadata)
            .map_err(|e| AppError::Internal(format!("Corrupt session metadata: {}", e)))?;
        Ok(UploadSession {
            id: row.id,
            total_size: row.total_size.max(0) as u64,
            bytes_received: row.bytes_received.max(0) as u64,
            status,
            created_at: row.created_at,
            expires_at: row.expires_at,
            metadata,
        })
    }
}

const SESSION_COLUMNS: &str =
    "id, total_size, bytes_received, status, created_at, expires_at, metadata";

#[derive(Clone)]
pub struct PostgresSessionRepository {
    pool: PgPool,
}

impl PostgresSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_many(
        &self,
        sql: &str,
        now: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<UploadSession>, AppError> {
        let mut query = sqlx::query_as::<_, SessionRow>(sql);
        if let Some(now) = now {
            query = query.bind(now);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.into_iter().map(UploadSession::try_from).collect()
    }
}

/// Statuses a session may be in before moving to `next`
fn allowed_sources(next: SessionStatus) -> Vec<String> {
    [
        SessionStatus::Created,
        SessionStatus::Uploading,
        SessionStatus::Completed,
        SessionStatus::Expired,
        SessionStatus::Terminated,
    ]
    .into_iter()
    .filter(|from| from.can_transition_to(next))
    .map(|from| from.as_str().to_string())
    .collect()
}

#[async_trait]
impl SessionRepository for PostgresSessionRepository {
    #[tracing::instrument(skip(self, session), fields(session_id = %session.id))]
    async fn insert(&self, session: &UploadSession) -> Result<(), AppError> {
        let metadata = serde_json::to_value(&session.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, total_size, bytes_received, status, created_at, expires_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&session.id)
        .bind(session.total_size as i64)
        .bind(session.bytes_received as i64)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UploadSession>, AppError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM upload_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UploadSession::try_from).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn advance(
        &self,
        id: &str,
        expected_offset: u64,
        new_offset: u64,
        status: SessionStatus,
    ) -> Result<Option<UploadSession>, AppError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE upload_sessions
            SET bytes_received = $3, status = $4
            WHERE id = $1
              AND bytes_received = $2
              AND $3 <= total_size
              AND status = ANY($5)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(id)
        .bind(expected_offset as i64)
        .bind(new_offset as i64)
        .bind(status.as_str())
        .bind(allowed_sources(status))
        .fetch_optional(&self.pool)
        .await?;

        row.map(UploadSession::try_from).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn finish(&self, id: &str, status: SessionStatus) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = $2
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(allowed_sources(status))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UploadSession>, AppError> {
        self.fetch_many(
            &format!(
                r#"
                SELECT {} FROM upload_sessions
                WHERE status IN ('created', 'uploading') AND expires_at < $1
                ORDER BY expires_at ASC
                LIMIT $2
                "#,
                SESSION_COLUMNS
            ),
            Some(now),
            limit,
        )
        .await
    }

    async fn find_completed(&self, limit: i64) -> Result<Vec<UploadSession>, AppError> {
        self.fetch_many(
            &format!(
                r#"
                SELECT {} FROM upload_sessions
                WHERE status = 'completed'
                ORDER BY created_at ASC
                LIMIT $1
                "#,
                SESSION_COLUMNS
            ),
            None,
            limit,
        )
        .await
    }
}

/// Process-local session store.
#[derive(Clone, Default)]
pub struct InMemorySessionRepository {
    sessions: Arc<RwLock<HashMap<String, UploadSession>>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Overwrite a stored session as-is, e.g. to backdate its expiry.
    pub async fn put_raw(&self, session: UploadSession) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn insert(&self, session: &UploadSession) -> Result<(), AppError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(AppError::Internal(format!(
                "Session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UploadSession>, AppError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn advance(
        &self,
        id: &str,
        expected_offset: u64,
        new_offset: u64,
        status: SessionStatus,
    ) -> Result<Option<UploadSession>, AppError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return Ok(None);
        };
        if session.bytes_received != expected_offset
            || new_offset > session.total_size
            || !session.status.can_transition_to(status)
        {
            return Ok(None);
        }
        session.bytes_received = new_offset;
        session.status = status;
        Ok(Some(session.clone()))
    }

    async fn finish(&self, id: &str, status: SessionStatus) -> Result<bool, AppError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) if session.status.can_transition_to(status) => {
                session.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, AppError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UploadSession>, AppError> {
        let sessions = self.sessions.read().await;
        let mut expired: Vec<UploadSession> = sessions
            .values()
            .filter(|s| {
                matches!(s.status, SessionStatus::Created | SessionStatus::Uploading)
                    && s.expires_at < now
            })
            .cloned()
            .collect();
        expired.sort_by_key(|s| s.expires_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn find_completed(&self, limit: i64) -> Result<Vec<UploadSession>, AppError> {
        let sessions = self.sessions.read().await;
        let mut completed: Vec<UploadSession> = sessions
            .values()
            .filter(|s| s.status == SessionStatus::Completed)
            .cloned()
            .collect();
        completed.sort_by_key(|s| s.created_at);
        completed.truncate(limit.max(0) as usize);
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn session(size: u64) -> UploadSession {
        UploadSession::new(
            size,
            SessionMetadata {
                filename: "a.bin".to_string(),
                content_type: "application/octet-stream".to_string(),
                form_id: "f".to_string(),
                field_key: "k".to_string(),
                owner_user_id: None,
                submission_id: None,
                extra: BTreeMap::new(),
            },
            Utc::now(),
            chrono::Duration::hours(1),
        )
    }

    #[tokio::test]
    async fn advance_requires_matching_offset() {
        let repo = InMemorySessionRepository::new();
        let s = session(100);
        repo.insert(&s).await.unwrap();

        assert!(repo
            .advance(&s.id, 50, 60, SessionStatus::Uploading)
            .await
            .unwrap()
            .is_none());

        let updated = repo
            .advance(&s.id, 0, 60, SessionStatus::Uploading)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.bytes_received, 60);
        assert_eq!(updated.status, SessionStatus::Uploading);

        // would overrun total_size
        assert!(repo
            .advance(&s.id, 60, 101, SessionStatus::Completed)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn completed_is_reached_once() {
        let repo = InMemorySessionRepository::new();
        let s = session(10);
        repo.insert(&s).await.unwrap();

        assert!(repo
            .advance(&s.id, 0, 10, SessionStatus::Completed)
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .advance(&s.id, 10, 10, SessionStatus::Completed)
            .await
            .unwrap()
            .is_none());
        assert!(!repo.finish(&s.id, SessionStatus::Terminated).await.unwrap());
    }

    #[tokio::test]
    async fn find_expired_skips_live_and_completed() {
        let repo = InMemorySessionRepository::new();
        let mut old = session(10);
        old.expires_at = Utc::now() - chrono::Duration::minutes(1);
        let mut done = session(10);
        done.expires_at = Utc::now() - chrono::Duration::minutes(1);
        done.status = SessionStatus::Completed;
        let live = session(10);
        for s in [&old, &done, &live] {
            repo.insert(s).await.unwrap();
        }

        let expired = repo.find_expired(Utc::now(), 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);

        let completed = repo.find_completed(10).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done.id);
    }
}
