//! HTTP error response conversion
//!
//! Handlers return `Result<_, HttpAppError>`. Domain errors (`AppError`,
//! `TransferError`) convert into it and render as a JSON [`ErrorResponse`]
//! with the status from [`ErrorMetadata::http_status_code`].

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use formdrop_core::constants::TUS_VERSION;
use formdrop_core::{AppError, ErrorMetadata, LogLevel};
use formdrop_transfer::TransferError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Machine-readable error code for programmatic handling
    pub code: String,
    /// Whether the same request may succeed if retried
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

/// Wrapper type for AppError to implement IntoResponse
/// (orphan rule: both the trait and AppError are foreign to this crate).
#[derive(Debug)]
pub struct HttpAppError(pub AppError);

impl From<AppError> for HttpAppError {
    fn from(err: AppError) -> Self {
        HttpAppError(err)
    }
}

impl From<TransferError> for HttpAppError {
    fn from(err: TransferError) -> Self {
        HttpAppError(err.into())
    }
}

impl From<anyhow::Error> for HttpAppError {
    fn from(err: anyhow::Error) -> Self {
        HttpAppError(AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        })
    }
}

fn log_error(error: &AppError) {
    let error_type = error.error_type();
    match error.log_level() {
        LogLevel::Debug => {
            tracing::debug!(error = %error, error_type = error_type, "Request rejected");
        }
        LogLevel::Warn => {
            tracing::warn!(error = %error, error_type = error_type, "Request rejected");
        }
        LogLevel::Error => {
            tracing::error!(error = %error, error_type = error_type, "Request failed");
        }
    }
}

fn is_production_env() -> bool {
    std::env::var("ENVIRONMENT")
        .or_else(|_| std::env::var("APP_ENV"))
        .map(|env| env.to_lowercase() == "production" || env.to_lowercase() == "prod")
        .unwrap_or(false)
}

impl HttpAppError {
    fn body(&self, with_details: bool) -> ErrorResponse {
        let app_error = &self.0;
        ErrorResponse {
            error: app_error.client_message(),
            details: with_details.then(|| app_error.detailed_message()),
            error_type: with_details.then(|| app_error.error_type().to_string()),
            code: app_error.error_code().to_string(),
            recoverable: app_error.is_recoverable(),
            suggested_action: app_error.suggested_action().map(String::from),
        }
    }
}

impl IntoResponse for HttpAppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        log_error(&self.0);

        let show_details = !is_production_env() && !self.0.is_sensitive();
        let mut response = (status, Json(self.body(show_details))).into_response();

        // A client speaking another protocol version learns which ones we accept.
        if status == StatusCode::PRECONDITION_FAILED {
            response
                .headers_mut()
                .insert("tus-version", HeaderValue::from_static(TUS_VERSION));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: impl Into<HttpAppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn transfer_errors_use_protocol_statuses() {
        assert_eq!(
            status_of(TransferError::NotFound("abc".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(TransferError::OffsetMismatch {
                expected: 0,
                actual: 500000
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(TransferError::Locked("abc".into())),
            StatusCode::LOCKED
        );
        assert_eq!(
            status_of(AppError::UnsupportedMediaType("text/plain".into())),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test]
    fn precondition_failed_advertises_version() {
        let response =
            HttpAppError(AppError::PreconditionFailed("missing".into())).into_response();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(response.headers()["tus-version"], TUS_VERSION);
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = HttpAppError(AppError::Internal("pool exhausted".into()));
        let body = serde_json::to_value(err.body(false)).unwrap();
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["code"], "INTERNAL_ERROR");
        assert_eq!(body["recoverable"], true);
        assert!(body.get("details").is_none());
    }

    #[test]
    fn error_response_shape() {
        let err = HttpAppError(AppError::Conflict("offset".into()));
        let body = serde_json::to_value(err.body(true)).unwrap();
        assert_eq!(body["code"], "OFFSET_MISMATCH");
        assert_eq!(body["error_type"], "Conflict");
        assert!(body["suggested_action"].is_string());
    }
}
