//! Data models for the upload pipeline
//!
//! Sessions are owned by the transfer server, jobs by the queue, and the
//! submission file reference is the value written into the owning form
//! submission once a job succeeds.

mod submission;
mod upload_job;
mod upload_session;

pub use submission::*;
pub use upload_job::*;
pub use upload_session::*;
