//! Route configuration and setup

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, head, post},
    Router,
};
use formdrop_core::Config;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health, tus};
use crate::state::SharedState;

/// Setup all application routes
pub fn setup_routes(config: &Config, state: SharedState) -> Result<Router<()>> {
    let cors = setup_cors(config);

    let app = transfer_routes(config)
        .merge(health_routes())
        .layer(ConcurrencyLimitLayer::new(config.http_concurrency_limit()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(app)
}

/// The TUS endpoint mounted at `UPLOAD_BASE_PATH`.
fn transfer_routes(config: &Config) -> Router<SharedState> {
    let base = config.upload_base_path();
    let max_chunk = usize::try_from(config.upload_max_chunk_size_bytes()).unwrap_or(usize::MAX);

    Router::new()
        .route(base, post(tus::create_upload).options(tus::options))
        .route(
            &format!("{}/{{id}}", base),
            head(tus::upload_offset)
                .patch(tus::append_chunk)
                .delete(tus::terminate_upload)
                .options(tus::options),
        )
        .layer(axum::middleware::from_fn(tus::tus_resumable_middleware))
        // Chunks are bounded by the chunk limit rather than axum's 2 MB default.
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_chunk))
}

fn health_routes() -> Router<SharedState> {
    Router::new()
        .route("/health/live", get(health::liveness_check))
        .route("/health/ready", get(health::readiness_check))
}

/// Browsers must be able to send and read the protocol headers.
fn setup_cors(config: &Config) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::HEAD,
        Method::POST,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let exposed = [
        header::LOCATION,
        tus::TUS_RESUMABLE,
        tus::TUS_VERSION_HEADER,
        tus::TUS_MAX_SIZE,
        tus::TUS_EXTENSION,
        tus::UPLOAD_OFFSET,
        tus::UPLOAD_LENGTH,
        tus::UPLOAD_EXPIRES,
    ];

    let cors = if config.cors_origins().iter().any(|o| o == "*") {
        if config.is_production() {
            tracing::warn!("CORS configured to allow all origins - not recommended for production");
        }
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins()
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    cors.allow_methods(methods)
        .allow_headers(Any)
        .expose_headers(exposed)
}
