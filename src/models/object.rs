//! Keys, generated names and the result values of pipeline operations.

use crate::services::{error_translator::PipelineError, key_sanitizer};
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use std::{fmt, str::FromStr};

/// Length of the random token embedded in generated names.
const TOKEN_LEN: usize = 12;

/// A normalized object-store key of the form `{namespace}/{generatedName}`.
///
/// Only contains `[A-Za-z0-9_./-]`, never a `..` sequence, never a leading
/// `/` and never an empty segment. The only ways to obtain one are
/// [`key_sanitizer::sanitize`] and [`ObjectKey::child`], so holding an
/// `ObjectKey` means the invariants hold.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Wrap a string the sanitizer has already normalized.
    pub(crate) fn from_sanitized(key: String) -> Self {
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading path segment, used for coarse categorization.
    pub fn namespace(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Append a generated name below this key, re-validating the result.
    pub fn child(&self, name: &GeneratedName) -> Result<ObjectKey, PipelineError> {
        key_sanitizer::sanitize(&format!("{}/{}", self.0, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ObjectKey {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        key_sanitizer::sanitize(raw)
    }
}

/// `{unixMillis}-{randomToken}{extension}`.
///
/// Uniqueness is probabilistic; collisions are not reconciled because
/// objects are only ever retrieved through the key handed back on upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedName(String);

impl GeneratedName {
    /// Generate a fresh name from the current time and a random token.
    ///
    /// `extension` is expected to be already sanitized (lowercase
    /// alphanumeric, no dot).
    pub fn new(extension: Option<&str>) -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self::from_parts(Utc::now().timestamp_millis(), &token, extension)
    }

    pub(crate) fn from_parts(unix_millis: i64, token: &str, extension: Option<&str>) -> Self {
        match extension {
            Some(ext) => Self(format!("{unix_millis}-{token}.{ext}")),
            None => Self(format!("{unix_millis}-{token}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeneratedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An inbound file owned by exactly one in-flight request.
///
/// Everything except `source` is caller-declared and therefore untrusted.
pub struct UploadCandidate<S> {
    /// Filename as declared by the client.
    pub filename: String,

    /// MIME type as declared by the client.
    pub mime: String,

    /// Optional target namespace requested by the caller.
    pub folder: Option<String>,

    /// Forward-only byte source; read exactly once.
    pub source: S,
}

/// Result of a successful upload.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub key: ObjectKey,
    pub url: String,
    pub size: u64,
    pub mime: String,
    pub folder: String,
}

/// A signed retrieval link, possibly served from cache.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalUrl {
    pub url: String,
    pub cache_hit: bool,
    pub expires_at: DateTime<Utc>,
}

/// A signed link allowing a trusted client to PUT directly to the store.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_name_shape() {
        let name = GeneratedName::new(Some("pdf"));
        let (millis, rest) = name.as_str().split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        let (token, ext) = rest.split_once('.').unwrap();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(ext, "pdf");
    }

    #[test]
    fn generated_name_without_extension() {
        let name = GeneratedName::from_parts(1_700_000_000_000, "abc123", None);
        assert_eq!(name.as_str(), "1700000000000-abc123");
    }

    #[test]
    fn child_keys_stay_valid() {
        let folder: ObjectKey = "documents".parse().unwrap();
        let name = GeneratedName::from_parts(1, "tok", Some("pdf"));
        let key = folder.child(&name).unwrap();
        assert_eq!(key.as_str(), "documents/1-tok.pdf");
        assert_eq!(key.namespace(), "documents");
    }

    #[test]
    fn parse_rejects_traversal() {
        assert!("../etc/passwd".parse::<ObjectKey>().is_err());
    }
}
