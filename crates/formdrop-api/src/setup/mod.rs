//! Application setup and initialization

pub mod database;
pub mod routes;
pub mod server;
pub mod services;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;
use formdrop_core::{Config, HookRegistry};

use crate::state::AppState;
use services::BackgroundTasks;

/// Initialize the entire application: telemetry, session store, storage,
/// services and routes. Background tasks are already running on return.
pub async fn initialize_app(config: Config) -> Result<(Arc<AppState>, axum::Router, BackgroundTasks)> {
    crate::telemetry::init_telemetry(config.log_json());
    tracing::info!(
        environment = %config.environment(),
        session_store = %config.session_store(),
        storage_backend = %config.storage_backend(),
        "Configuration loaded and validated successfully"
    );

    let (repositories, pool) = database::open_session_store(&config).await?;

    let storage = storage::setup_storage(&config).await?;

    let services =
        services::initialize_services(&config, repositories, storage, pool, HookRegistry::new());
    let router = routes::setup_routes(&config, services.state.clone())?;
    let state = services.state.clone();
    let background = services.background.start();

    Ok((state, router, background))
}
