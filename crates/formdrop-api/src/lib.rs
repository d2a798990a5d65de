//! formdrop HTTP API
//!
//! The TUS 1.0.0 transfer endpoint, health checks, and the wiring that
//! connects the transfer server, job queue and worker pool at startup.

pub mod error;
pub mod handlers;
pub mod setup;
pub mod state;
pub mod telemetry;

pub use error::{ErrorResponse, HttpAppError};
pub use state::AppState;
