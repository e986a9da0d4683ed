//! StorageService: the pipeline facade handed to the web layer.
//!
//! One instance is built at startup around a long-lived backend handle and
//! shared (cheaply cloned) across requests. Every caller-supplied key is
//! sanitized before it reaches the cache or the backend; every backend error
//! goes through the translator before it leaves this module.

use crate::{
    config::PipelineSettings,
    models::{
        identity::Identity,
        object::{GeneratedName, ObjectKey, RetrievalUrl, UploadCandidate, UploadReceipt, UploadUrl},
    },
    services::{
        backend::ObjectBackend,
        error_translator::{PipelineError, render_chain, translate, translate_listing},
        file_validator,
        key_sanitizer::sanitize,
        retry::RetryPolicy,
        transfer_engine::{self, TransferEngine, TransferSettings},
        url_cache::{CachedLink, UrlCache},
    },
};
use axum::http::Method;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use std::{fmt, io, sync::Arc};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub type StorageResult<T> = Result<T, PipelineError>;

/// Prefix listed by reachability probes; never written.
const PROBE_PREFIX: &str = "health-probe";

#[derive(Clone)]
pub struct StorageService {
    backend: Arc<dyn ObjectBackend>,
    cache: Arc<UrlCache>,
    engine: TransferEngine,
    settings: Arc<PipelineSettings>,
}

impl fmt::Debug for StorageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageService")
            .field("backend", &self.backend)
            .field("cached_links", &self.cache.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl StorageService {
    /// Wire the pipeline around `backend`.
    ///
    /// Fails with `ConfigurationError` when the settings are inconsistent.
    pub fn new(backend: Arc<dyn ObjectBackend>, settings: PipelineSettings) -> StorageResult<Self> {
        settings.validate()?;

        let cache = UrlCache::new(
            settings.cache.capacity,
            settings.cache.ttl,
            settings.cache.link_validity,
        )?;
        let engine = TransferEngine::new(
            backend.clone(),
            TransferSettings {
                part_size: settings.limits.part_size,
                max_in_flight: settings.limits.max_in_flight_parts,
            },
            settings.retry.clone(),
        );

        Ok(Self {
            backend,
            cache: Arc::new(cache),
            engine,
            settings: Arc::new(settings),
        })
    }

    fn retry(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    /// Validate and store one inbound file under a freshly generated key.
    ///
    /// The source is read once: a bounded preview is validated, then the
    /// preview and the unread remainder are streamed to the backend. Nothing
    /// is written unless every validation gate passed.
    #[instrument(
        skip(self, identity, candidate),
        fields(
            subject = %identity.subject_id,
            role = %identity.role,
            filename = %candidate.filename,
            declared_mime = %candidate.mime,
        )
    )]
    pub async fn upload<S>(
        &self,
        identity: &Identity,
        candidate: UploadCandidate<S>,
    ) -> StorageResult<UploadReceipt>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let UploadCandidate {
            filename,
            mime,
            folder,
            source,
        } = candidate;
        let limits = &self.settings.limits;

        // the folder hint is caller-controlled; reject it before reading a byte
        let folder = match folder.as_deref().map(str::trim) {
            Some(hint) if !hint.is_empty() => Some(sanitize(hint)?),
            _ => None,
        };

        let mut source = Box::pin(source);
        let preview =
            transfer_engine::read_preview(&mut source, limits.preview_window, limits.max_file_size)
                .await?;
        let accepted = file_validator::validate(&mime, &filename, preview.bytes())?;

        let folder = match folder {
            Some(folder) => folder,
            None => sanitize(file_validator::namespace_for(&accepted.mime))?,
        };
        let key = folder.child(&GeneratedName::new(accepted.extension.as_deref()))?;

        let transferred = self
            .engine
            .upload(&key, preview.replay(source), &accepted.mime, limits.max_file_size)
            .await?;

        // the key's content changed; links issued for it before are stale
        self.cache.invalidate(&key);
        let link = match self.sign(Method::GET, &key).await {
            Ok(link) => link,
            Err(err) => {
                // the caller never learns the key, so the object would be unreachable
                self.discard(&key).await;
                return Err(err);
            }
        };

        info!(
            %key,
            size = transferred.size,
            parts = transferred.parts,
            mime = %accepted.mime,
            "upload accepted"
        );
        Ok(UploadReceipt {
            url: link.url,
            size: transferred.size,
            mime: accepted.mime,
            folder: folder.to_string(),
            key,
        })
    }

    /// Signed GET link for `raw_key`, served from cache while fresh.
    ///
    /// On a miss the object's existence is confirmed first, so a deleted key
    /// yields `NotFound` instead of a link to nothing.
    #[instrument(skip(self))]
    pub async fn retrieval_url(&self, raw_key: &str) -> StorageResult<RetrievalUrl> {
        let key = sanitize(raw_key)?;

        if let Some(link) = self.cache.get(&key, Instant::now().into_std()) {
            debug!(%key, "signed link cache hit");
            return Ok(RetrievalUrl {
                url: link.url,
                cache_hit: true,
                expires_at: link.expires_at,
            });
        }

        let ticket = self.cache.ticket();
        self.head(&key).await?;
        let link = self.sign(Method::GET, &key).await?;
        if !self
            .cache
            .insert(key.clone(), link.clone(), ticket, Instant::now().into_std())
        {
            debug!(%key, "key invalidated while signing, link not cached");
        }

        Ok(RetrievalUrl {
            url: link.url,
            cache_hit: false,
            expires_at: link.expires_at,
        })
    }

    /// Signed PUT link for trusted direct-to-store uploads. No validation is
    /// applied to what the holder uploads.
    #[instrument(skip(self))]
    pub async fn upload_url(&self, raw_key: &str) -> StorageResult<UploadUrl> {
        let key = sanitize(raw_key)?;
        self.cache.invalidate(&key);

        let link = self.sign(Method::PUT, &key).await?;
        info!(%key, "issued direct upload link");
        Ok(UploadUrl {
            url: link.url,
            expires_at: link.expires_at,
        })
    }

    /// Delete the object at `raw_key` and drop any cached link for it.
    #[instrument(skip(self))]
    pub async fn delete(&self, raw_key: &str) -> StorageResult<()> {
        let key = sanitize(raw_key)?;

        if let Err(err) = self.head(&key).await {
            if matches!(err, PipelineError::NotFound { .. }) {
                self.cache.invalidate(&key);
            }
            return Err(err);
        }

        let backend = &self.backend;
        let target = &key;
        self.retry()
            .run("delete", || async move {
                backend
                    .delete(target)
                    .await
                    .map_err(|err| translate(err, target.as_str()))
            })
            .await?;

        self.cache.invalidate(&key);
        info!(%key, "object deleted");
        Ok(())
    }

    /// Whether the backend answers at all. Has no side effects.
    pub async fn health_check(&self) -> bool {
        match self.probe().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %render_chain(&err), "object store health check failed");
                false
            }
        }
    }

    /// Startup verification: like [`health_check`](Self::health_check) but
    /// with retries, and reporting why the backend is unusable.
    pub async fn verify(&self) -> StorageResult<()> {
        let backend = &self.backend;
        self.retry()
            .run("verify", || async move { Self::probe_with(backend.as_ref()).await })
            .await
    }

    /// Number of links currently cached.
    pub fn cached_links(&self) -> usize {
        self.cache.len()
    }

    async fn probe(&self) -> StorageResult<()> {
        Self::probe_with(self.backend.as_ref()).await
    }

    /// List a fresh prefix nothing is written under. An existing bucket
    /// answers with an empty listing; a missing one is a configuration error.
    async fn probe_with(backend: &dyn ObjectBackend) -> StorageResult<()> {
        let prefix = format!("{PROBE_PREFIX}/{}", Uuid::new_v4());
        backend
            .list_prefix(&prefix)
            .await
            .map(|_| ())
            .map_err(|err| translate_listing(err, &prefix))
    }

    /// Best-effort removal of an object nobody was told about.
    async fn discard(&self, key: &ObjectKey) {
        let backend = &self.backend;
        let removed = self
            .retry()
            .run("discard", || async move {
                backend
                    .delete(key)
                    .await
                    .map_err(|err| translate(err, key.as_str()))
            })
            .await;
        match removed {
            Ok(()) => info!(%key, "removed stored object after signing failed"),
            Err(err) => error!(
                %key,
                error = %render_chain(&err),
                "failed to remove stored object after signing failed, object is orphaned"
            ),
        }
    }

    async fn head(&self, key: &ObjectKey) -> StorageResult<()> {
        let backend = &self.backend;
        self.retry()
            .run("head", || async move {
                backend
                    .head(key)
                    .await
                    .map(|_| ())
                    .map_err(|err| translate(err, key.as_str()))
            })
            .await
    }

    async fn sign(&self, method: Method, key: &ObjectKey) -> StorageResult<CachedLink> {
        let validity = self.settings.cache.link_validity;
        // stamped before signing so the reported expiry is never late
        let issued_at = Utc::now();
        let backend = &self.backend;

        let url = self
            .retry()
            .run("sign", || {
                let method = method.clone();
                async move {
                    backend
                        .signed_url(method, key, validity)
                        .await
                        .map_err(|err| translate(err, key.as_str()))
                }
            })
            .await?;

        let expires_at = TimeDelta::from_std(validity)
            .ok()
            .and_then(|validity| issued_at.checked_add_signed(validity))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(CachedLink {
            url: url.to_string(),
            expires_at,
        })
    }
}
