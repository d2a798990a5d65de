use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::server::ResumableTransferServer;

/// Background task that periodically runs [`ResumableTransferServer::sweep_expired`].
pub struct SessionSweeper {
    server: ResumableTransferServer,
    every: Duration,
}

impl SessionSweeper {
    pub fn new(server: ResumableTransferServer, every: Duration) -> Self {
        Self { server, every }
    }

    /// Spawn the sweep loop. It runs once immediately, then on every tick until
    /// `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::spawn(async move {
            tracing::info!(interval_secs = self.every.as_secs(), "Upload session sweeper started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.server.sweep_expired(Utc::now()).await {
                            tracing::error!(error = %e, "Upload session sweep failed");
                        }
                    }
                }
            }
            tracing::info!("Upload session sweeper stopped");
        })
    }
}
