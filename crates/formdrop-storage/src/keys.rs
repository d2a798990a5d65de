//! Shared key generation for storage backends.
//!
//! Staged chunks live under `staging/{session_id}/` with zero-padded offsets so
//! that lexicographic key order equals byte order. Durable objects live at
//! `uploads/{form_id}/{session_id}/{filename}`; the key depends only on the job
//! payload, so re-processing a job overwrites the same object.

use formdrop_core::constants::{MAX_FILENAME_LENGTH, STAGING_PREFIX, UPLOADS_PREFIX};

/// Prefix holding every staged chunk of a session (trailing slash included).
pub fn staging_prefix(session_id: &str) -> String {
    format!("{}/{}/", STAGING_PREFIX, session_id)
}

pub fn staging_chunk_key(session_id: &str, offset: u64) -> String {
    format!("{}/{}/{:020}", STAGING_PREFIX, session_id, offset)
}

/// Offset encoded in a staged chunk key, if the key is one.
pub fn chunk_offset(key: &str) -> Option<u64> {
    key.rsplit('/').next()?.parse().ok()
}

pub fn upload_key(form_id: &str, session_id: &str, filename: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        UPLOADS_PREFIX,
        sanitize_segment(form_id),
        sanitize_segment(session_id),
        sanitize_filename(filename)
    )
}

/// Reduce a client filename to a safe single path segment.
///
/// Keeps ASCII letters, digits, `.`, `-` and `_`; everything else becomes `_`.
/// Leading dots are stripped and `..` sequences collapsed.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut out: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    while out.contains("..") {
        out = out.replace("..", ".");
    }
    let out = out.trim_start_matches('.');
    let mut out: String = out.chars().take(MAX_FILENAME_LENGTH).collect();
    if out.is_empty() {
        out.push_str("file");
    }
    out
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
