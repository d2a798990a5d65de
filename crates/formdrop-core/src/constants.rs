//! Protocol and layout constants.

/// Protocol version spoken by the transfer endpoint.
pub const TUS_VERSION: &str = "1.0.0";

/// Extensions advertised in `Tus-Extension`.
pub const TUS_EXTENSIONS: &str = "creation,expiration,termination";

/// Content type required on chunk (PATCH) requests.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Prefix for staged chunk objects: `staging/{session_id}/{offset}`.
pub const STAGING_PREFIX: &str = "staging";

/// Prefix for durable upload objects: `uploads/{form_id}/{session_id}/{filename}`.
pub const UPLOADS_PREFIX: &str = "uploads";

/// Maximum accepted filename length in bytes.
pub const MAX_FILENAME_LENGTH: usize = 255;

// Upload-Metadata wire keys
pub const META_FILENAME: &str = "filename";
pub const META_FILETYPE: &str = "filetype";
pub const META_FORM_ID: &str = "formId";
pub const META_FIELD_NAME: &str = "fieldName";
pub const META_SUBMISSION_ID: &str = "submissionId";

/// Extensions rejected at session creation unless overridden by configuration.
pub const DEFAULT_BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "com", "scr", "msi", "dll", "ps1", "vbs", "jar", "sh",
];
