//! Health check handlers.

use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::state::SharedState;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness check - process is running.
pub async fn liveness_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "alive" })),
    )
}

/// Readiness check - session store and storage backend answer in time.
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let mut ready = true;

    let database = match &state.pool {
        None => "in_memory".to_string(),
        Some(pool) => {
            match tokio::time::timeout(CHECK_TIMEOUT, sqlx::query("SELECT 1").execute(pool)).await
            {
                Ok(Ok(_)) => "ready".to_string(),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Database readiness check failed");
                    ready = false;
                    format!("not_ready: {}", e)
                }
                Err(_) => {
                    tracing::error!("Database readiness check timed out");
                    ready = false;
                    "timeout".to_string()
                }
            }
        }
    };

    let storage = match tokio::time::timeout(
        CHECK_TIMEOUT,
        state.storage.exists("health-check-non-existent-key"),
    )
    .await
    {
        Ok(Ok(_)) => "ready".to_string(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Storage readiness check failed");
            ready = false;
            format!("not_ready: {}", e)
        }
        Err(_) => {
            ready = false;
            "timeout".to_string()
        }
    };

    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "not_ready" },
            "database": database,
            "storage": storage,
            "storage_backend": state.storage.backend_type().to_string(),
        })),
    )
}
