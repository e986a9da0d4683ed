//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks object store reachability

use crate::services::storage_service::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe; always returns 200 OK and never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Lists an unused probe prefix in the object store. HTTP 200 when the
/// bucket answers, HTTP 503 otherwise (a missing bucket included).
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let store_ok = service.health_check().await;

    let mut checks = HashMap::new();
    checks.insert(
        "object_store",
        CheckStatus {
            ok: store_ok,
            error: (!store_ok).then(|| "object store unreachable".to_string()),
        },
    );
    checks.insert(
        "url_cache",
        CheckStatus {
            ok: true,
            error: None,
        },
    );

    let body = ReadyResponse {
        status: if store_ok { "ok".into() } else { "error".into() },
        cached_links: service.cached_links(),
        checks,
    };

    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    cached_links: usize,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
