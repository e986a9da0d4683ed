use crate::services::error_translator::{ErrorKind, PipelineError, render_chain};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::{error, warn};

/// HTTP-facing error: a status, a stable code and a caller-safe message.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for 401 when no authenticated identity was supplied
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", msg)
    }

    /// Shortcut for 400 on malformed requests
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
    }
}

/// Transport status for each pipeline error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidKey => StatusCode::BAD_REQUEST,
        ErrorKind::UnsupportedType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::BlockedExtension | ErrorKind::SignatureMismatch => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::SizeExceeded => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Interrupted => StatusCode::BAD_REQUEST,
        ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code,
            "message": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let kind = err.kind();
        // backend detail goes to the log, never to the caller
        let message = match kind {
            ErrorKind::BackendUnavailable => {
                warn!(code = %kind, error = %render_chain(&err), "backend unavailable");
                "storage backend is temporarily unavailable".to_string()
            }
            ErrorKind::ConfigurationError => {
                error!(code = %kind, error = %render_chain(&err), "backend misconfigured");
                "storage backend is misconfigured".to_string()
            }
            _ => err.to_string(),
        };
        Self::new(status_for(kind), kind.as_str(), message)
    }
}
