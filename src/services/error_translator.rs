//! Closed error taxonomy of the pipeline and the single place where
//! backend failures are translated into it.
//!
//! Nothing outside this module inspects `object_store::Error`; every backend
//! call site funnels its error through [`translate`].

use std::{error::Error as StdError, fmt, io};
use thiserror::Error;
use tracing::debug;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Stable identifiers the web layer maps onto transport status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidKey,
    UnsupportedType,
    BlockedExtension,
    SignatureMismatch,
    SizeExceeded,
    NotFound,
    Interrupted,
    BackendUnavailable,
    ConfigurationError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidKey => "INVALID_KEY",
            ErrorKind::UnsupportedType => "UNSUPPORTED_TYPE",
            ErrorKind::BlockedExtension => "BLOCKED_EXTENSION",
            ErrorKind::SignatureMismatch => "SIGNATURE_MISMATCH",
            ErrorKind::SizeExceeded => "SIZE_EXCEEDED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Interrupted => "UPLOAD_INTERRUPTED",
            ErrorKind::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorKind::ConfigurationError => "CONFIGURATION_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor-neutral name for what the object store reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendFailure {
    NotFound,
    AccessDenied,
    BadCredentials,
    SignatureMismatch,
    BucketMissing,
    Throttled,
    Timeout,
    ServerError,
    EntityTooLarge,
    ConnectionRefused,
    EndpointUnresolvable,
    Unrecognized,
}

impl BackendFailure {
    /// Transient failures are worth retrying for idempotent operations.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            BackendFailure::Throttled
                | BackendFailure::Timeout
                | BackendFailure::ServerError
                | BackendFailure::ConnectionRefused
        )
    }
}

/// Every failure the pipeline can surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid object key: {reason}")]
    InvalidKey { reason: &'static str },

    #[error("content type `{mime}` is not accepted")]
    UnsupportedType { mime: String },

    #[error("files with extension `.{extension}` are not accepted")]
    BlockedExtension { extension: String },

    #[error("file content does not match declared type `{mime}`")]
    SignatureMismatch { mime: String },

    #[error("payload exceeds the size limit")]
    SizeExceeded { limit: Option<u64> },

    #[error("object `{key}` not found")]
    NotFound { key: String },

    #[error("upload stream ended unexpectedly")]
    Interrupted {
        #[source]
        source: io::Error,
    },

    #[error("storage backend unavailable")]
    BackendUnavailable {
        failure: BackendFailure,
        #[source]
        source: Option<BoxError>,
    },

    #[error("storage backend misconfigured: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidKey { .. } => ErrorKind::InvalidKey,
            PipelineError::UnsupportedType { .. } => ErrorKind::UnsupportedType,
            PipelineError::BlockedExtension { .. } => ErrorKind::BlockedExtension,
            PipelineError::SignatureMismatch { .. } => ErrorKind::SignatureMismatch,
            PipelineError::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            PipelineError::NotFound { .. } => ErrorKind::NotFound,
            PipelineError::Interrupted { .. } => ErrorKind::Interrupted,
            PipelineError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            PipelineError::Configuration { .. } => ErrorKind::ConfigurationError,
        }
    }

    /// Only transient backend failures are retried; everything else is
    /// deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::BackendUnavailable { failure, .. } if failure.is_transient()
        )
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub fn size_exceeded(limit: u64) -> Self {
        PipelineError::SizeExceeded { limit: Some(limit) }
    }
}

/// Name the failure an `object_store` error represents.
///
/// Typed variants are used where `object_store` provides them; for generic
/// HTTP failures the rendered error chain is inspected for the S3 error codes
/// and transport messages the store passes through.
pub fn classify(err: &object_store::Error) -> BackendFailure {
    match err {
        object_store::Error::NotFound { .. } => return BackendFailure::NotFound,
        object_store::Error::PermissionDenied { .. } => return BackendFailure::AccessDenied,
        object_store::Error::Unauthenticated { .. } => return BackendFailure::BadCredentials,
        _ => {}
    }
    classify_message(&render_chain(err))
}

fn classify_message(chain: &str) -> BackendFailure {
    let chain = chain.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| chain.contains(needle));

    // a missing bucket also comes back as a 404
    if has(&["nosuchbucket"]) {
        BackendFailure::BucketMissing
    } else if has(&["nosuchkey", "status code: 404"]) {
        BackendFailure::NotFound
    } else if has(&["signaturedoesnotmatch"]) {
        BackendFailure::SignatureMismatch
    } else if has(&["invalidaccesskeyid", "expiredtoken", "invalidtoken", "status code: 401"]) {
        BackendFailure::BadCredentials
    } else if has(&["accessdenied", "status code: 403"]) {
        BackendFailure::AccessDenied
    } else if has(&["entitytoolarge", "status code: 413"]) {
        BackendFailure::EntityTooLarge
    } else if has(&["slowdown", "throttl", "too many requests", "status code: 429"]) {
        BackendFailure::Throttled
    } else if has(&["timed out", "timeout"]) {
        BackendFailure::Timeout
    } else if has(&["dns error", "failed to lookup address", "name or service not known"]) {
        BackendFailure::EndpointUnresolvable
    } else if has(&["connection refused", "connection reset", "error trying to connect"]) {
        BackendFailure::ConnectionRefused
    } else if has(&["status code: 5", "internalerror", "service unavailable", "bad gateway"]) {
        BackendFailure::ServerError
    } else {
        BackendFailure::Unrecognized
    }
}

/// Map a backend failure onto the pipeline taxonomy.
///
/// `key` names the object the operation targeted; it is only used for the
/// `NotFound` message. The original error is kept as the source for
/// diagnostics but never becomes the caller-facing message.
pub fn translate(err: object_store::Error, key: &str) -> PipelineError {
    let failure = classify(&err);
    debug!(key, ?failure, error = %render_chain(&err), "translated backend failure");

    match failure {
        BackendFailure::NotFound => PipelineError::NotFound {
            key: key.to_string(),
        },
        BackendFailure::EntityTooLarge => PipelineError::SizeExceeded { limit: None },
        BackendFailure::AccessDenied
        | BackendFailure::BadCredentials
        | BackendFailure::SignatureMismatch
        | BackendFailure::BucketMissing
        | BackendFailure::EndpointUnresolvable => PipelineError::Configuration {
            message: configuration_message(failure).to_string(),
            source: Some(Box::new(err)),
        },
        BackendFailure::Throttled
        | BackendFailure::Timeout
        | BackendFailure::ServerError
        | BackendFailure::ConnectionRefused
        | BackendFailure::Unrecognized => PipelineError::BackendUnavailable {
            failure,
            source: Some(Box::new(err)),
        },
    }
}

/// Map a failed bucket-level listing onto the pipeline taxonomy.
///
/// Listing a prefix succeeds with an empty result when nothing matches, so a
/// `NotFound` here can only mean the bucket itself does not exist.
pub fn translate_listing(err: object_store::Error, prefix: &str) -> PipelineError {
    match classify(&err) {
        BackendFailure::NotFound => PipelineError::Configuration {
            message: configuration_message(BackendFailure::BucketMissing).to_string(),
            source: Some(Box::new(err)),
        },
        _ => translate(err, prefix),
    }
}

fn configuration_message(failure: BackendFailure) -> &'static str {
    match failure {
        BackendFailure::AccessDenied => "access to the bucket was denied",
        BackendFailure::BadCredentials => "credentials were rejected",
        BackendFailure::SignatureMismatch => "request signature was rejected",
        BackendFailure::BucketMissing => "bucket does not exist",
        BackendFailure::EndpointUnresolvable => "endpoint could not be resolved",
        _ => "backend rejected the configuration",
    }
}

/// Render an error and all of its sources as one line.
pub fn render_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        rendered.push_str(": ");
        rendered.push_str(&source.to_string());
        current = source.source();
    }
    rendered
}
