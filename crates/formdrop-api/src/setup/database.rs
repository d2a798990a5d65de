//! Session store selection: Postgres (with migrations) or process memory.

use std::time::Duration;

use anyhow::{Context, Result};
use formdrop_core::{Config, SessionStore};
use formdrop_db::Repositories;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// Repositories for the configured store, plus the pool when there is one.
///
/// The pool is handed back so the worker pool can listen for new-job
/// notifications on it.
pub async fn open_session_store(config: &Config) -> Result<(Repositories, Option<PgPool>)> {
    match config.session_store() {
        SessionStore::Postgres => {
            let pool = connect(config).await?;
            migrate(&pool).await?;
            Ok((Repositories::postgres(pool.clone()), Some(pool)))
        }
        SessionStore::Memory => {
            tracing::warn!(
                "Using in-memory session store; state is lost on restart and not shared between instances"
            );
            Ok((Repositories::in_memory(), None))
        }
    }
}

async fn connect(config: &Config) -> Result<PgPool> {
    let url = config
        .database_url()
        .context("DATABASE_URL is required for the postgres session store")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections())
        .acquire_timeout(Duration::from_secs(config.db_timeout_seconds()))
        .idle_timeout(POOL_IDLE_TIMEOUT)
        .max_lifetime(POOL_MAX_LIFETIME)
        .connect(url)
        .await
        .context("Failed to connect to the session store database")?;

    tracing::info!(
        max_connections = config.db_max_connections(),
        "Session store database connected"
    );
    Ok(pool)
}

/// Sessions, claims, jobs and submissions tables.
async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("Failed to apply session store migrations")?;
    tracing::info!("Session store migrations applied");
    Ok(())
}
