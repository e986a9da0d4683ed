use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use upload_gateway::{
    config::AppConfig,
    routes,
    services::{
        backend::StoreBackend,
        error_translator::{self, render_chain},
        storage_service::StorageService,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;

    tracing::info!("Starting upload-gateway with config: {:?}", cfg);

    // --- Initialize backend client once; shared by every request ---
    let backend = StoreBackend::from_settings(&cfg.backend, &cfg.pipeline.retry)
        .context("building object store client")?;
    let storage = StorageService::new(Arc::new(backend), cfg.pipeline.clone())
        .context("building upload pipeline")?;

    // --- Verify the backend before accepting traffic ---
    match storage.verify().await {
        Ok(()) => tracing::info!("Object store reachable"),
        Err(err) if err.kind() == error_translator::ErrorKind::ConfigurationError => {
            return Err(err).context("object store rejected the configuration");
        }
        Err(err) => tracing::warn!(
            "Object store not reachable yet ({}); starting anyway",
            render_chain(&err)
        ),
    }

    // --- Build router ---
    let app: Router = routes::routes::routes()
        .with_state(storage)
        .layer(TraceLayer::new_for_http());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
