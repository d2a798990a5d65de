//! Upload metadata validation
//!
//! Parses the `Upload-Metadata` header and checks a new session against the
//! configured [`UploadPolicy`]:
//! - size limit
//! - required keys (`filename`, `filetype`, `formId`, `fieldName`)
//! - filename length and blocked extensions

use std::collections::BTreeMap;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;

use crate::constants::{
    DEFAULT_BLOCKED_EXTENSIONS, MAX_FILENAME_LENGTH, META_FIELD_NAME, META_FILENAME,
    META_FILETYPE, META_FORM_ID, META_SUBMISSION_ID,
};
use crate::error::AppError;
use crate::hooks::AuthContext;
use crate::models::SessionMetadata;

/// Maximum number of key/value pairs accepted in one header
pub const MAX_METADATA_PAIRS: usize = 64;

// Clients differ on whether they pad base64 values.
const METADATA_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadValidationError {
    #[error("Upload-Metadata is malformed: {0}")]
    MalformedMetadata(String),

    #[error("Upload-Metadata key '{0}' appears more than once")]
    DuplicateKey(String),

    #[error("Required metadata '{0}' is missing")]
    MissingField(&'static str),

    #[error("Filename is {length} bytes; the maximum is {max}")]
    FilenameTooLong { length: usize, max: usize },

    #[error("Files with extension '.{0}' are not accepted")]
    BlockedExtension(String),

    #[error("Upload-Length {size} exceeds the maximum of {max} bytes")]
    TooLarge { size: u64, max: u64 },
}

impl From<UploadValidationError> for AppError {
    fn from(err: UploadValidationError) -> Self {
        match err {
            UploadValidationError::TooLarge { .. } => AppError::PayloadTooLarge(err.to_string()),
            other => AppError::InvalidInput(other.to_string()),
        }
    }
}

/// Parse an `Upload-Metadata` header into decoded key/value pairs.
///
/// Pairs are comma separated; each is `key` or `key base64(value)`. A key
/// without a value maps to the empty string.
pub fn parse_upload_metadata(
    header: &str,
) -> Result<BTreeMap<String, String>, UploadValidationError> {
    let mut pairs = BTreeMap::new();
    if header.trim().is_empty() {
        return Ok(pairs);
    }

    for raw in header.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(UploadValidationError::MalformedMetadata(
                "empty pair".to_string(),
            ));
        }

        let mut parts = raw.split_whitespace();
        let key = parts.next().unwrap_or_default();
        let encoded = parts.next();
        if parts.next().is_some() {
            return Err(UploadValidationError::MalformedMetadata(format!(
                "pair for '{}' has more than one value",
                key
            )));
        }

        let value = match encoded {
            Some(encoded) => {
                let bytes = METADATA_BASE64.decode(encoded).map_err(|e| {
                    UploadValidationError::MalformedMetadata(format!(
                        "value for '{}' is not base64: {}",
                        key, e
                    ))
                })?;
                String::from_utf8(bytes).map_err(|_| {
                    UploadValidationError::MalformedMetadata(format!(
                        "value for '{}' is not UTF-8",
                        key
                    ))
                })?
            }
            None => String::new(),
        };

        if pairs.insert(key.to_string(), value).is_some() {
            return Err(UploadValidationError::DuplicateKey(key.to_string()));
        }
        if pairs.len() > MAX_METADATA_PAIRS {
            return Err(UploadValidationError::MalformedMetadata(format!(
                "more than {} pairs",
                MAX_METADATA_PAIRS
            )));
        }
    }

    Ok(pairs)
}

/// Limits applied when a session is created.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_size: u64,
    pub blocked_extensions: Vec<String>,
    pub max_filename_length: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_size: 5120 * 1024 * 1024,
            blocked_extensions: DEFAULT_BLOCKED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            max_filename_length: MAX_FILENAME_LENGTH,
        }
    }
}

impl UploadPolicy {
    pub fn check_size(&self, size: u64) -> Result<(), UploadValidationError> {
        if size > self.max_size {
            return Err(UploadValidationError::TooLarge {
                size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    pub fn check_filename(&self, filename: &str) -> Result<(), UploadValidationError> {
        if filename.len() > self.max_filename_length {
            return Err(UploadValidationError::FilenameTooLong {
                length: filename.len(),
                max: self.max_filename_length,
            });
        }

        if let Some((_, ext)) = filename.rsplit_once('.') {
            let ext = ext.to_ascii_lowercase();
            if self.blocked_extensions.iter().any(|b| b.eq_ignore_ascii_case(&ext)) {
                return Err(UploadValidationError::BlockedExtension(ext));
            }
        }
        Ok(())
    }

    /// Build session metadata from decoded header pairs.
    ///
    /// Wire keys are mapped onto the model; unrecognised keys are kept in
    /// `extra` and forwarded with the job. The owner comes from `auth`, never
    /// from client metadata.
    pub fn session_metadata(
        &self,
        mut pairs: BTreeMap<String, String>,
        auth: &AuthContext,
    ) -> Result<SessionMetadata, UploadValidationError> {
        let mut required = |key: &'static str| -> Result<String, UploadValidationError> {
            match pairs.remove(key) {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(UploadValidationError::MissingField(key)),
            }
        };

        let filename = required(META_FILENAME)?;
        let content_type = required(META_FILETYPE)?;
        let form_id = required(META_FORM_ID)?;
        let field_key = required(META_FIELD_NAME)?;

        self.check_filename(&filename)?;

        let submission_id = pairs
            .remove(META_SUBMISSION_ID)
            .filter(|v| !v.trim().is_empty());

        Ok(SessionMetadata {
            filename,
            content_type,
            form_id,
            field_key,
            owner_user_id: auth.user_id.clone(),
            submission_id,
            extra: pairs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    fn encode(v: &str) -> String {
        STANDARD.encode(v)
    }

    fn header(pairs: &[(&str, &str)]) -> String {
        pairs
            .iter()
            .map(|(k, v)| format!("{} {}", k, encode(v)))
            .collect::<Vec<_>>()
            .join(",")
    }

    #[test]
    fn parses_pairs_and_bare_keys() {
        let h = format!("filename {},is_confidential", encode("world_domination.pdf"));
        let pairs = parse_upload_metadata(&h).unwrap();
        assert_eq!(pairs["filename"], "world_domination.pdf");
        assert_eq!(pairs["is_confidential"], "");
    }

    #[test]
    fn accepts_unpadded_values() {
        let pairs = parse_upload_metadata("filename YS5i").unwrap();
        assert_eq!(pairs["filename"], "a.b");
        let pairs = parse_upload_metadata("filename YWI").unwrap();
        assert_eq!(pairs["filename"], "ab");
    }

    #[test]
    fn rejects_duplicates_and_garbage() {
        assert_eq!(
            parse_upload_metadata("a YQ==,a Yg==").unwrap_err(),
            UploadValidationError::DuplicateKey("a".to_string())
        );
        assert!(matches!(
            parse_upload_metadata("a !!!"),
            Err(UploadValidationError::MalformedMetadata(_))
        ));
        assert!(matches!(
            parse_upload_metadata("a YQ==,,b Yg=="),
            Err(UploadValidationError::MalformedMetadata(_))
        ));
    }

    #[test]
    fn maps_wire_keys_and_keeps_extras() {
        let h = header(&[
            ("filename", "cv.pdf"),
            ("filetype", "application/pdf"),
            ("formId", "job-application"),
            ("fieldName", "resume"),
            ("submissionId", "sub-1"),
            ("source", "mobile"),
        ]);
        let pairs = parse_upload_metadata(&h).unwrap();
        let meta = UploadPolicy::default()
            .session_metadata(pairs, &AuthContext::user("u-9"))
            .unwrap();
        assert_eq!(meta.filename, "cv.pdf");
        assert_eq!(meta.content_type, "application/pdf");
        assert_eq!(meta.form_id, "job-application");
        assert_eq!(meta.field_key, "resume");
        assert_eq!(meta.submission_id.as_deref(), Some("sub-1"));
        assert_eq!(meta.owner_user_id.as_deref(), Some("u-9"));
        assert_eq!(meta.extra.get("source").map(String::as_str), Some("mobile"));
        assert_eq!(meta.extra.len(), 1);
    }

    #[test]
    fn missing_required_key() {
        let h = header(&[("filename", "a.pdf"), ("filetype", "application/pdf")]);
        let pairs = parse_upload_metadata(&h).unwrap();
        let err = UploadPolicy::default()
            .session_metadata(pairs, &AuthContext::anonymous())
            .unwrap_err();
        assert_eq!(err, UploadValidationError::MissingField("formId"));
    }

    #[test]
    fn filename_rules() {
        let policy = UploadPolicy::default();
        assert!(policy.check_filename("photo.JPG").is_ok());
        assert_eq!(
            policy.check_filename("setup.EXE").unwrap_err(),
            UploadValidationError::BlockedExtension("exe".to_string())
        );
        let long = format!("{}.txt", "a".repeat(300));
        assert!(matches!(
            policy.check_filename(&long),
            Err(UploadValidationError::FilenameTooLong { .. })
        ));
    }

    #[test]
    fn size_limit_maps_to_413() {
        let policy = UploadPolicy {
            max_size: 100,
            ..Default::default()
        };
        let err = policy.check_size(101).unwrap_err();
        assert!(matches!(
            AppError::from(err),
            AppError::PayloadTooLarge(_)
        ));
        assert!(policy.check_size(100).is_ok());
    }
}
