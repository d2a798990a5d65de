use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use formdrop_core::models::SubmissionFileReference;
use formdrop_core::AppError;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tokio::sync::RwLock;

/// Write access to the owning business record of an upload.
///
/// The pipeline only ever sets one field of a submission's `data` document.
#[async_trait]
pub trait SubmissionRepository: Send + Sync {
    /// Set `data[field_key]` of the submission to `file`.
    ///
    /// Fails with [`AppError::NotFound`] when the submission does not exist.
    async fn set_file_field(
        &self,
        submission_id: &str,
        field_key: &str,
        file: &SubmissionFileReference,
    ) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct PostgresSubmissionRepository {
    pool: PgPool,
}

impl PostgresSubmissionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubmissionRepository for PostgresSubmissionRepository {
    #[tracing::instrument(skip(self, file))]
    async fn set_file_field(
        &self,
        submission_id: &str,
        field_key: &str,
        file: &SubmissionFileReference,
    ) -> Result<(), AppError> {
        let value = serde_json::to_value(file)?;
        let result = sqlx::query(
            r#"
            UPDATE form_submissions
            SET data = jsonb_set(COALESCE(data, '{}'::jsonb), ARRAY[$2::text], $3, true),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(submission_id)
        .bind(field_key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Submission {} not found",
                submission_id
            )));
        }

        tracing::info!(
            submission_id = %submission_id,
            field_key = %field_key,
            "Submission file field updated"
        );
        Ok(())
    }
}

/// Process-local submissions, each a JSON object of field values.
#[derive(Clone, Default)]
pub struct InMemorySubmissionRepository {
    submissions: Arc<RwLock<HashMap<String, Map<String, Value>>>>,
}

impl InMemorySubmissionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty submission.
    pub async fn insert(&self, submission_id: impl Into<String>) {
        self.submissions
            .write()
            .await
            .insert(submission_id.into(), Map::new());
    }

    pub async fn get(&self, submission_id: &str) -> Option<Map<String, Value>> {
        self.submissions.read().await.get(submission_id).cloned()
    }
}

#[async_trait]
impl SubmissionRepository for InMemorySubmissionRepository {
    async fn set_file_field(
        &self,
        submission_id: &str,
        field_key: &str,
        file: &SubmissionFileReference,
    ) -> Result<(), AppError> {
        let value = serde_json::to_value(file)?;
        let mut submissions = self.submissions.write().await;
        let data = submissions.get_mut(submission_id).ok_or_else(|| {
            AppError::NotFound(format!("Submission {} not found", submission_id))
        })?;
        data.insert(field_key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> SubmissionFileReference {
        SubmissionFileReference {
            url: "https://example.test/a.pdf".to_string(),
            name: "a.pdf".to_string(),
            size: 3,
            content_type: "application/pdf".to_string(),
            storage: "s3".to_string(),
            key: "uploads/form/s1/a.pdf".to_string(),
        }
    }

    #[tokio::test]
    async fn sets_only_the_named_field() {
        let repo = InMemorySubmissionRepository::new();
        repo.insert("sub-1").await;
        repo.set_file_field("sub-1", "resume", &reference())
            .await
            .unwrap();

        let data = repo.get("sub-1").await.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data["resume"]["type"], "application/pdf");
        assert_eq!(data["resume"]["key"], "uploads/form/s1/a.pdf");
    }

    #[tokio::test]
    async fn unknown_submission_is_not_found() {
        let repo = InMemorySubmissionRepository::new();
        let err = repo
            .set_file_field("missing", "resume", &reference())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
