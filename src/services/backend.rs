//! Object-store backend used by the pipeline.
//!
//! [`ObjectBackend`] is the narrow surface the pipeline needs. [`StoreBackend`]
//! implements it on top of any [`ObjectStore`] plus a [`Signer`]: an S3
//! bucket for deployments, or an in-memory store with a local HMAC signer for
//! development and tests. Errors are returned untranslated; callers pass them
//! through [`error_translator::translate`](super::error_translator::translate).

use crate::{
    config::{BackendSettings, S3Settings},
    models::object::ObjectKey,
    services::{error_translator::PipelineError, retry::RetryPolicy},
};
use async_trait::async_trait;
use axum::http::Method;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use object_store::{
    Attribute, BackoffConfig, ClientOptions, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
    PutMultipartOptions, RetryConfig, aws::AmazonS3Builder, memory::InMemory, path::Path,
    signer::Signer,
};
use sha2::Sha256;
use std::{fmt, sync::Arc, time::Duration};
use url::Url;

/// Operations the pipeline performs against the object store.
#[async_trait]
pub trait ObjectBackend: Send + Sync + fmt::Debug + 'static {
    /// Open a multipart upload that becomes visible only once completed.
    async fn begin_upload(
        &self,
        key: &ObjectKey,
        content_type: &str,
    ) -> object_store::Result<Box<dyn MultipartUpload>>;

    /// Pre-authorize `method` on `key` for `expires_in`.
    async fn signed_url(
        &self,
        method: Method,
        key: &ObjectKey,
        expires_in: Duration,
    ) -> object_store::Result<Url>;

    async fn head(&self, key: &ObjectKey) -> object_store::Result<ObjectMeta>;

    async fn delete(&self, key: &ObjectKey) -> object_store::Result<()>;

    /// One level of the listing under `prefix`. Used to check that the
    /// bucket exists: an unmatched prefix lists as empty.
    async fn list_prefix(&self, prefix: &str) -> object_store::Result<ListResult>;
}

/// [`ObjectBackend`] over an `object_store` implementation.
#[derive(Clone, Debug)]
pub struct StoreBackend {
    store: Arc<dyn ObjectStore>,
    signer: Arc<dyn Signer>,
}

impl StoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, signer: Arc<dyn Signer>) -> Self {
        Self { store, signer }
    }

    /// Build the backend described by the configuration.
    pub fn from_settings(
        settings: &BackendSettings,
        retry: &RetryPolicy,
    ) -> Result<Self, PipelineError> {
        match settings {
            BackendSettings::S3(s3) => Self::s3(s3, retry),
            BackendSettings::Memory {
                public_base_url,
                signing_secret,
            } => Ok(Self::in_memory(public_base_url.clone(), signing_secret.clone())),
        }
    }

    /// Connect to an S3-compatible bucket.
    ///
    /// Part uploads cannot be replayed by the pipeline (the inbound stream is
    /// forward-only), so transport-level retries for them are delegated to
    /// the store's own retry layer, configured from the same policy.
    pub fn s3(settings: &S3Settings, retry: &RetryPolicy) -> Result<Self, PipelineError> {
        let client_options = ClientOptions::new()
            .with_connect_timeout(settings.connect_timeout)
            .with_timeout(settings.request_timeout);

        let retry_config = RetryConfig {
            backoff: BackoffConfig {
                init_backoff: retry.base_delay,
                max_backoff: retry.max_delay,
                base: 2.0,
            },
            max_retries: retry.max_attempts.saturating_sub(1) as usize,
            retry_timeout: settings.request_timeout * retry.max_attempts.max(1),
        };

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_client_options(client_options)
            .with_retry(retry_config);

        if let Some(endpoint) = &settings.endpoint {
            builder = builder.with_endpoint(endpoint);
            if endpoint.starts_with("http://") {
                builder = builder.with_allow_http(true);
            }
        }
        if let Some(access_key) = &settings.access_key_id {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret_key) = &settings.secret_access_key {
            builder = builder.with_secret_access_key(secret_key);
        }

        let s3 = Arc::new(builder.build().map_err(|err| PipelineError::Configuration {
            message: "invalid S3 settings".into(),
            source: Some(Box::new(err)),
        })?);

        Ok(Self::new(s3.clone(), s3))
    }

    /// In-process store whose links are signed with a local HMAC key.
    pub fn in_memory(public_base_url: Url, signing_secret: Vec<u8>) -> Self {
        Self::new(
            Arc::new(InMemory::new()),
            Arc::new(LocalSigner::new(public_base_url, signing_secret)),
        )
    }
}

#[async_trait]
impl ObjectBackend for StoreBackend {
    async fn begin_upload(
        &self,
        key: &ObjectKey,
        content_type: &str,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        let mut opts = PutMultipartOptions::default();
        opts.attributes
            .insert(Attribute::ContentType, content_type.to_string().into());
        self.store.put_multipart_opts(&path_of(key), opts).await
    }

    async fn signed_url(
        &self,
        method: Method,
        key: &ObjectKey,
        expires_in: Duration,
    ) -> object_store::Result<Url> {
        self.signer
            .signed_url(method, &path_of(key), expires_in)
            .await
    }

    async fn head(&self, key: &ObjectKey) -> object_store::Result<ObjectMeta> {
        self.store.head(&path_of(key)).await
    }

    async fn delete(&self, key: &ObjectKey) -> object_store::Result<()> {
        self.store.delete(&path_of(key)).await
    }

    async fn list_prefix(&self, prefix: &str) -> object_store::Result<ListResult> {
        self.store.list_with_delimiter(Some(&Path::from(prefix))).await
    }
}

fn path_of(key: &ObjectKey) -> Path {
    Path::from(key.as_str())
}

/// Signs links for the in-memory backend.
///
/// Links have the shape
/// `{base}/{key}?method=GET&expires={unix}&signature={b64(hmac-sha256)}`,
/// the MAC covering method, key and expiry.
pub struct LocalSigner {
    base: Url,
    secret: Vec<u8>,
}

impl LocalSigner {
    pub fn new(base: Url, secret: Vec<u8>) -> Self {
        Self { base, secret }
    }

    fn signature(&self, method: &Method, path: &Path, expires: i64) -> object_store::Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret).map_err(|_| {
            object_store::Error::Generic {
                store: "local-signer",
                source: "invalid signing key".into(),
            }
        })?;
        mac.update(format!("{method}\n{path}\n{expires}").as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("base", &self.base.as_str())
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn signed_url(
        &self,
        method: Method,
        path: &Path,
        expires_in: Duration,
    ) -> object_store::Result<Url> {
        let expires = Utc::now().timestamp() + expires_in.as_secs() as i64;
        let signature = self.signature(&method, path, expires)?;

        let raw = format!("{}/{}", self.base.as_str().trim_end_matches('/'), path);
        let mut url = Url::parse(&raw).map_err(|err| object_store::Error::Generic {
            store: "local-signer",
            source: Box::new(err),
        })?;
        url.query_pairs_mut()
            .append_pair("method", method.as_str())
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url)
    }
}
