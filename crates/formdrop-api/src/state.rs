//! Shared application state handed to every handler.

use std::sync::Arc;

use formdrop_core::Config;
use formdrop_storage::Storage;
use formdrop_transfer::ResumableTransferServer;
use formdrop_worker::JobQueue;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub transfer: ResumableTransferServer,
    pub queue: JobQueue,
    pub storage: Arc<dyn Storage>,
    /// `None` when sessions and jobs live in process memory.
    pub pool: Option<PgPool>,
}

impl AppState {
    /// Mount point of the transfer endpoint, e.g. `/files`.
    pub fn upload_base_path(&self) -> &str {
        self.config.upload_base_path()
    }

    pub fn upload_url(&self, id: &str) -> String {
        format!("{}/{}", self.upload_base_path(), id)
    }
}

pub type SharedState = Arc<AppState>;
