//! Resumable transfer sessions
//!
//! [`ResumableTransferServer`] implements the offset-validated chunk protocol
//! on top of a [`formdrop_db::SessionRepository`] and a
//! [`formdrop_storage::StagingArea`]. Completed sessions are handed to the
//! registered on-complete hooks; [`SessionSweeper`] reclaims expired sessions
//! and retries failed handoffs.

pub mod error;
pub mod server;
pub mod sweeper;

pub use error::TransferError;
pub use server::{
    AppendOutcome, ResumableTransferServer, SessionProgress, SweepReport, TransferSettings,
};
pub use sweeper::SessionSweeper;

