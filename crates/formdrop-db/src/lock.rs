use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use formdrop_core::AppError;
use sqlx::PgPool;
use tokio::sync::Mutex;

/// Exclusive per-session claim with an owner token and a TTL.
///
/// At most one owner holds a live claim on a session id. A claim whose TTL has
/// elapsed (for instance because its server instance crashed) can be taken over.
#[async_trait]
pub trait SessionLock: Send + Sync {
    /// Returns true if `owner` now holds the claim.
    async fn try_claim(&self, session_id: &str, owner: &str, ttl: Duration)
        -> Result<bool, AppError>;

    /// Release a claim held by `owner`. Releasing someone else's claim is a no-op.
    async fn release(&self, session_id: &str, owner: &str) -> Result<(), AppError>;
}

fn expiry(ttl: Duration) -> Result<DateTime<Utc>, AppError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| AppError::Internal(format!("Invalid lock TTL: {}", e)))?;
    Ok(Utc::now() + ttl)
}

#[derive(Clone)]
pub struct PostgresSessionLock {
    pool: PgPool,
}

impl PostgresSessionLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionLock for PostgresSessionLock {
    #[tracing::instrument(skip(self))]
    async fn try_claim(
        &self,
        session_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let expires_at = expiry(ttl)?;
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO upload_session_claims (session_id, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (session_id) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE upload_session_claims.expires_at < NOW()
            RETURNING owner
            "#,
        )
        .bind(session_id)
        .bind(owner)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.as_deref() == Some(owner))
    }

    #[tracing::instrument(skip(self))]
    async fn release(&self, session_id: &str, owner: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM upload_session_claims WHERE session_id = $1 AND owner = $2")
            .bind(session_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemorySessionLock {
    claims: Arc<Mutex<HashMap<String, (String, DateTime<Utc>)>>>,
}

impl InMemorySessionLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionLock for InMemorySessionLock {
    async fn try_claim(
        &self,
        session_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let expires_at = expiry(ttl)?;
        let mut claims = self.claims.lock().await;
        match claims.get(session_id) {
            Some((_, current_expiry)) if *current_expiry >= Utc::now() => Ok(false),
            _ => {
                claims.insert(session_id.to_string(), (owner.to_string(), expires_at));
                Ok(true)
            }
        }
    }

    async fn release(&self, session_id: &str, owner: &str) -> Result<(), AppError> {
        let mut claims = self.claims.lock().await;
        if claims
            .get(session_id)
            .is_some_and(|(holder, _)| holder == owner)
        {
            claims.remove(session_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let lock = InMemorySessionLock::new();
        let ttl = Duration::from_secs(60);
        assert!(lock.try_claim("s1", "a", ttl).await.unwrap());
        assert!(!lock.try_claim("s1", "b", ttl).await.unwrap());
        assert!(lock.try_claim("s2", "b", ttl).await.unwrap());

        // only the holder can release
        lock.release("s1", "b").await.unwrap();
        assert!(!lock.try_claim("s1", "b", ttl).await.unwrap());

        lock.release("s1", "a").await.unwrap();
        assert!(lock.try_claim("s1", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_claim_can_be_taken_over() {
        let lock = InMemorySessionLock::new();
        assert!(lock
            .try_claim("s1", "crashed", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock
            .try_claim("s1", "b", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
