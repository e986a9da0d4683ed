//! Normalization and validation of object-store keys.
//!
//! Every caller-supplied key passes through [`sanitize`] before it reaches
//! the backend or the URL cache. This is the only defense against path
//! traversal, so there is no unchecked way to build an [`ObjectKey`].

use crate::{models::object::ObjectKey, services::error_translator::PipelineError};

/// Longest key accepted after normalization.
pub const MAX_KEY_LEN: usize = 500;

/// Normalize `raw` into an [`ObjectKey`].
///
/// Rejected outright:
/// - keys starting with `/`
/// - any `..` sequence
/// - characters outside `[A-Za-z0-9_./-]`
///
/// Repeated `/`, trailing `/` and `.` segments are collapsed. The result
/// must be non-empty and at most [`MAX_KEY_LEN`] characters. Applying
/// `sanitize` to its own output yields the same key.
pub fn sanitize(raw: &str) -> Result<ObjectKey, PipelineError> {
    if raw.starts_with('/') {
        return Err(PipelineError::InvalidKey {
            reason: "must not start with `/`",
        });
    }
    if raw.contains("..") {
        return Err(PipelineError::InvalidKey {
            reason: "must not contain `..`",
        });
    }
    if !raw.chars().all(is_key_char) {
        return Err(PipelineError::InvalidKey {
            reason: "contains characters outside [A-Za-z0-9_./-]",
        });
    }

    let normalized = raw
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");

    if normalized.is_empty() {
        return Err(PipelineError::InvalidKey { reason: "empty" });
    }
    if normalized.len() > MAX_KEY_LEN {
        return Err(PipelineError::InvalidKey {
            reason: "longer than 500 characters",
        });
    }

    Ok(ObjectKey::from_sanitized(normalized))
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-')
}
