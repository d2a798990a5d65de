//! TUS 1.0.0 endpoint: creation, offset query, chunk append and termination.

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use chrono::{DateTime, Utc};
use formdrop_core::constants::{OFFSET_OCTET_STREAM, TUS_EXTENSIONS, TUS_VERSION};
use formdrop_core::{AppError, AuthContext};

use crate::error::HttpAppError;
use crate::state::SharedState;

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_EXPIRES: HeaderName = HeaderName::from_static("upload-expires");

/// Format a timestamp as an RFC 7231 HTTP-date.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_u64_header(headers: &HeaderMap, name: &HeaderName) -> Result<u64, HttpAppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            HttpAppError(AppError::BadRequest(format!(
                "{} header is missing or not a non-negative integer",
                name
            )))
        })
}

fn require_offset_stream(headers: &HeaderMap) -> Result<(), HttpAppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let mime = content_type.split(';').next().unwrap_or("").trim();
    if mime.eq_ignore_ascii_case(OFFSET_OCTET_STREAM) {
        Ok(())
    } else {
        Err(HttpAppError(AppError::UnsupportedMediaType(format!(
            "Content-Type must be {}",
            OFFSET_OCTET_STREAM
        ))))
    }
}

/// Stamps `Tus-Resumable` on every response and rejects requests, other than
/// `OPTIONS`, that do not speak the supported protocol version.
pub async fn tus_resumable_middleware(request: Request, next: Next) -> Response {
    let speaks_tus = request.method() == Method::OPTIONS
        || request
            .headers()
            .get(&TUS_RESUMABLE)
            .is_some_and(|v| v.as_bytes() == TUS_VERSION.as_bytes());

    let mut response = if speaks_tus {
        next.run(request).await
    } else {
        HttpAppError(AppError::PreconditionFailed(format!(
            "Tus-Resumable: {} is required",
            TUS_VERSION
        )))
        .into_response()
    };
    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    response
}

/// `OPTIONS {base}`: advertise protocol version, size limit and extensions.
pub async fn options(State(state): State<SharedState>) -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            (TUS_VERSION_HEADER, TUS_VERSION.to_string()),
            (TUS_MAX_SIZE, state.transfer.policy().max_size.to_string()),
            (TUS_EXTENSION, TUS_EXTENSIONS.to_string()),
        ],
    )
}

/// `POST {base}`: create a session.
pub async fn create_upload(
    State(state): State<SharedState>,
    auth: Option<Extension<AuthContext>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpAppError> {
    let upload_length = parse_u64_header(&headers, &UPLOAD_LENGTH)?;
    let metadata = match headers.get(&UPLOAD_METADATA) {
        Some(value) => value.to_str().map_err(|_| {
            HttpAppError(AppError::InvalidInput(
                "Upload-Metadata must be ASCII".to_string(),
            ))
        })?,
        None => "",
    };
    let auth = auth
        .map(|Extension(auth)| auth)
        .unwrap_or_else(AuthContext::anonymous);

    let session = state.transfer.create(upload_length, metadata, &auth).await?;

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, state.upload_url(&session.id)),
            (UPLOAD_OFFSET, session.bytes_received.to_string()),
            (UPLOAD_EXPIRES, http_date(session.expires_at)),
        ],
    ))
}

/// `HEAD {base}/{id}`: current offset of a live session.
pub async fn upload_offset(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    let progress = state.transfer.status(&id).await?;
    Ok((
        StatusCode::OK,
        [
            (UPLOAD_OFFSET, progress.bytes_received.to_string()),
            (UPLOAD_LENGTH, progress.total_size.to_string()),
            (UPLOAD_EXPIRES, http_date(progress.expires_at)),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
    ))
}

/// `PATCH {base}/{id}`: append the request body at `Upload-Offset`.
pub async fn append_chunk(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpAppError> {
    require_offset_stream(&headers)?;
    let offset = parse_u64_header(&headers, &UPLOAD_OFFSET)?;

    let outcome = state.transfer.append_chunk(&id, offset, body).await?;

    Ok((
        StatusCode::NO_CONTENT,
        [
            (UPLOAD_OFFSET, outcome.offset.to_string()),
            (UPLOAD_EXPIRES, http_date(outcome.expires_at)),
        ],
    ))
}

/// `DELETE {base}/{id}`: terminate a session and discard its bytes.
pub async fn terminate_upload(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, HttpAppError> {
    state.transfer.terminate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
