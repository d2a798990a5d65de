//! Typed lifecycle hooks for transfer sessions
//!
//! Components that need to react to session events implement [`OnCreateHook`]
//! or [`OnCompleteHook`] and are registered explicitly on a [`HookRegistry`]
//! at startup. The job queue handoff is itself an on-complete hook.

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::UploadSession;

/// Already-authenticated caller identity supplied by the surrounding service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Option<String>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }
}

/// Returned by an on-create hook to refuse a new session. Surfaced to the client as 400.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HookRejection(pub String);

#[async_trait]
pub trait OnCreateHook: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect a session before it is persisted.
    async fn on_create(
        &self,
        session: &UploadSession,
        auth: &AuthContext,
    ) -> Result<(), HookRejection>;
}

/// Invoked once a session has received all of its bytes.
///
/// Implementations must be idempotent per session id. The session sweep
/// reruns every hook when a handoff failed part-way, and also when all hooks
/// succeeded but the completed session row could not be removed afterwards.
#[async_trait]
pub trait OnCompleteHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_complete(&self, session: &UploadSession) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    on_create: Vec<Arc<dyn OnCreateHook>>,
    on_complete: Vec<Arc<dyn OnCompleteHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_create(mut self, hook: Arc<dyn OnCreateHook>) -> Self {
        self.on_create.push(hook);
        self
    }

    pub fn with_on_complete(mut self, hook: Arc<dyn OnCompleteHook>) -> Self {
        self.on_complete.push(hook);
        self
    }

    /// Run on-create hooks in registration order, stopping at the first rejection.
    pub async fn run_on_create(
        &self,
        session: &UploadSession,
        auth: &AuthContext,
    ) -> Result<(), HookRejection> {
        for hook in &self.on_create {
            if let Err(rejection) = hook.on_create(session, auth).await {
                tracing::debug!(
                    hook = hook.name(),
                    reason = %rejection,
                    "Upload session rejected by on-create hook"
                );
                return Err(rejection);
            }
        }
        Ok(())
    }

    /// Run on-complete hooks in registration order, stopping at the first failure.
    pub async fn run_on_complete(&self, session: &UploadSession) -> anyhow::Result<()> {
        for hook in &self.on_complete {
            hook.on_complete(session)
                .await
                .map_err(|e| e.context(format!("on-complete hook '{}' failed", hook.name())))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field(
                "on_create",
                &self.on_create.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .field(
                "on_complete",
                &self.on_complete.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionMetadata;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session() -> UploadSession {
        UploadSession::new(
            10,
            SessionMetadata {
                filename: "a.txt".to_string(),
                content_type: "text/plain".to_string(),
                form_id: "f".to_string(),
                field_key: "k".to_string(),
                owner_user_id: None,
                submission_id: None,
                extra: BTreeMap::new(),
            },
            chrono::Utc::now(),
            chrono::Duration::hours(1),
        )
    }

    struct RequireUser;

    #[async_trait]
    impl OnCreateHook for RequireUser {
        fn name(&self) -> &'static str {
            "require_user"
        }

        async fn on_create(
            &self,
            _session: &UploadSession,
            auth: &AuthContext,
        ) -> Result<(), HookRejection> {
            match auth.user_id {
                Some(_) => Ok(()),
                None => Err(HookRejection("login required".to_string())),
            }
        }
    }

    struct Counting(Arc<AtomicUsize>, bool);

    #[async_trait]
    impl OnCompleteHook for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn on_complete(&self, _session: &UploadSession) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if self.1 {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn on_create_rejection_is_returned() {
        let registry = HookRegistry::new().with_on_create(Arc::new(RequireUser));
        let s = session();
        assert!(registry
            .run_on_create(&s, &AuthContext::user("u1"))
            .await
            .is_ok());
        let err = registry
            .run_on_create(&s, &AuthContext::anonymous())
            .await
            .unwrap_err();
        assert_eq!(err.0, "login required");
    }

    #[tokio::test]
    async fn on_complete_stops_at_first_failure() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let registry = HookRegistry::new()
            .with_on_complete(Arc::new(Counting(first.clone(), true)))
            .with_on_complete(Arc::new(Counting(second.clone(), false)));

        let err = registry.run_on_complete(&session()).await.unwrap_err();
        assert!(err.to_string().contains("counting"));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }
}
