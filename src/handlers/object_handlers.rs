//! HTTP handlers for file operations.
//! Streams multipart bodies into the pipeline without buffering them and
//! delegates everything else to `StorageService`.

use crate::{
    errors::AppError,
    models::{
        identity::Identity,
        object::{RetrievalUrl, UploadCandidate, UploadUrl},
    },
    services::storage_service::StorageService,
};
use axum::{
    Json,
    extract::{Multipart, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tracing::info;

/// Name of the multipart field carrying the file.
const FILE_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub folder: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

/// `POST /files?folder=` with a multipart `file` field.
pub async fn upload_file(
    State(service): State<StorageService>,
    identity: Identity,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let field = loop {
        match multipart
            .next_field()
            .await
            .map_err(|err| AppError::bad_request(err.body_text()))?
        {
            Some(field) if field.name() == Some(FILE_FIELD) => break field,
            Some(_) => continue,
            None => {
                return Err(AppError::bad_request(format!(
                    "multipart field `{FILE_FIELD}` is required"
                )));
            }
        }
    };

    let filename = field.file_name().unwrap_or_default().to_string();
    let mime = field.content_type().unwrap_or_default().to_string();
    let source = field.map(|chunk| chunk.map_err(io::Error::other));

    let receipt = service
        .upload(
            &identity,
            UploadCandidate {
                filename,
                mime,
                folder: query.folder,
                source,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `GET /files/url?key=`, a signed retrieval link, possibly cached.
pub async fn retrieval_url(
    State(service): State<StorageService>,
    _identity: Identity,
    Query(query): Query<KeyQuery>,
) -> Result<Json<RetrievalUrl>, AppError> {
    Ok(Json(service.retrieval_url(&query.key).await?))
}

/// `GET /files/upload-url?key=`, a signed link for a direct upload.
pub async fn upload_url(
    State(service): State<StorageService>,
    identity: Identity,
    Query(query): Query<KeyQuery>,
) -> Result<Json<UploadUrl>, AppError> {
    let link = service.upload_url(&query.key).await?;
    info!(subject = %identity.subject_id, key = %query.key, "direct upload link requested");
    Ok(Json(link))
}

/// `DELETE /files?key=`
pub async fn delete_file(
    State(service): State<StorageService>,
    identity: Identity,
    Query(query): Query<KeyQuery>,
) -> Result<StatusCode, AppError> {
    service.delete(&query.key).await?;
    info!(subject = %identity.subject_id, key = %query.key, "file deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use crate::{
        config::PipelineSettings,
        routes::routes::routes,
        services::{backend::StoreBackend, storage_service::StorageService},
    };
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;
    use url::Url;

    const BOUNDARY: &str = "gateway-test-boundary";

    fn app() -> Router {
        let backend = StoreBackend::in_memory(
            Url::parse("http://localhost:3000/objects").unwrap(),
            b"handler-secret".to_vec(),
        );
        let service = StorageService::new(Arc::new(backend), PipelineSettings::default()).unwrap();
        routes().with_state(service)
    }

    fn multipart(field: &str, filename: &str, mime: &str, content: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {mime}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::post(uri)
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .header("x-auth-subject", "user-1")
            .header("x-auth-role", "member")
            .body(Body::from(body))
            .unwrap()
    }

    fn authed(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-auth-subject", "user-1")
            .body(Body::empty())
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn pdf() -> Vec<u8> {
        let mut bytes = b"%PDF-1.4\n".to_vec();
        bytes.resize(2048, b'x');
        bytes
    }

    #[tokio::test]
    async fn upload_then_fetch_then_delete() {
        let app = app();

        let response = app
            .clone()
            .oneshot(upload_request(
                "/files",
                multipart("file", "report.pdf", "application/pdf", &pdf()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let receipt = json(response).await;
        let key = receipt["key"].as_str().unwrap().to_string();
        assert!(key.starts_with("documents/"));
        assert_eq!(receipt["size"], 2048);
        assert_eq!(receipt["folder"], "documents");

        let uri = format!("/files/url?key={key}");
        let first = json(app.clone().oneshot(authed("GET", &uri)).await.unwrap()).await;
        let second = json(app.clone().oneshot(authed("GET", &uri)).await.unwrap()).await;
        assert_eq!(first["cacheHit"], false);
        assert_eq!(second["cacheHit"], true);
        assert!(second["expiresAt"].is_string());

        let deleted = app
            .clone()
            .oneshot(authed("DELETE", &format!("/files?key={key}")))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let gone = app.oneshot(authed("GET", &uri)).await.unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(gone).await["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn rejections_map_to_distinct_statuses() {
        let cases = [
            ("a.exe", "application/pdf", pdf(), StatusCode::UNPROCESSABLE_ENTITY, "BLOCKED_EXTENSION"),
            ("a.png", "image/png", b"GIF89a".to_vec(), StatusCode::UNPROCESSABLE_ENTITY, "SIGNATURE_MISMATCH"),
            ("a.bin", "application/octet-stream", b"x".to_vec(), StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_TYPE"),
        ];
        for (filename, mime, content, status, code) in cases {
            let response = app()
                .oneshot(upload_request("/files", multipart("file", filename, mime, &content)))
                .await
                .unwrap();
            assert_eq!(response.status(), status, "{filename}");
            assert_eq!(json(response).await["error"], code);
        }
    }

    #[tokio::test]
    async fn traversal_folder_is_a_bad_request() {
        let response = app()
            .oneshot(upload_request(
                "/files?folder=../../etc",
                multipart("file", "report.pdf", "application/pdf", &pdf()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"], "INVALID_KEY");
    }

    #[tokio::test]
    async fn missing_file_field_is_a_bad_request() {
        let response = app()
            .oneshot(upload_request(
                "/files",
                multipart("attachment", "report.pdf", "application/pdf", &pdf()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn requests_without_identity_are_unauthorized() {
        let request = Request::get("/files/url?key=documents/a.pdf")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(response).await["error"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn memory_links_are_not_served_by_the_gateway() {
        let app = app();
        let response = app
            .clone()
            .oneshot(upload_request(
                "/files",
                multipart("file", "report.pdf", "application/pdf", &pdf()),
            ))
            .await
            .unwrap();
        let url = json(response).await["url"].as_str().unwrap().to_string();
        let path = url.trim_start_matches("http://localhost:3000");
        assert!(path.starts_with("/objects/documents/"));

        let response = app.oneshot(authed("GET", path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_url_is_a_put_link() {
        let response = app()
            .oneshot(authed("GET", "/files/upload-url?key=documents/direct.pdf"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert!(body["url"].as_str().unwrap().contains("method=PUT"));
    }
}
