use serde::{Deserialize, Serialize};

/// Field value written into a form submission once the file is durably stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionFileReference {
    pub url: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: String,
    /// Storage backend that holds the object (`s3`, `local`, `memory`).
    pub storage: String,
    pub key: String,
}
