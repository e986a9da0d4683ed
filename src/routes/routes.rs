//! Defines routes for the upload gateway.
//!
//! ## Structure
//! - **Health endpoints**
//!   - `GET    /healthz` liveness
//!   - `GET    /readyz` object store reachability
//!
//! - **File endpoints** (require `x-auth-subject`)
//!   - `POST   /files?folder=` multipart upload through the validation pipeline
//!   - `DELETE /files?key=` delete an object and drop its cached link
//!   - `GET    /files/url?key=` signed retrieval link
//!   - `GET    /files/upload-url?key=` signed direct upload link

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{delete_file, retrieval_url, upload_file, upload_url},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router; handlers share the `StorageService` state.
///
/// The default body limit is lifted on `/files`: the transfer engine enforces
/// the configured max file size while streaming.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/files",
            post(upload_file)
                .delete(delete_file)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/files/url", get(retrieval_url))
        .route("/files/upload-url", get(upload_url))
}
