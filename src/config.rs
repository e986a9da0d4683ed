use crate::services::{
    error_translator::PipelineError, file_validator, retry::RetryPolicy,
    transfer_engine::MIN_PART_SIZE,
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use rand::RngCore;
use std::{env, fmt, str::FromStr, time::Duration};
use url::Url;

/// Prefix shared by every environment variable the gateway reads.
const ENV_PREFIX: &str = "UPLOAD_GATEWAY_";

const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:3000/objects";

/// S3 caps a multipart upload at this many parts.
const MAX_UPLOAD_PARTS: u64 = 10_000;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendSettings,
    pub pipeline: PipelineSettings,
}

/// Size limits of the ingestion path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineLimits {
    /// Largest accepted object, in bytes.
    pub max_file_size: u64,
    /// Leading bytes held for signature validation.
    pub preview_window: usize,
    pub part_size: usize,
    pub max_in_flight_parts: usize,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            preview_window: 8 * 1024,
            part_size: MIN_PART_SIZE,
            max_in_flight_parts: 4,
        }
    }
}

/// Signed-link lifetime and caching.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    pub capacity: usize,
    /// How long a link stays cached; must be shorter than `link_validity`.
    pub ttl: Duration,
    /// How long a signed link itself is valid.
    pub link_validity: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(3000),
            link_validity: Duration::from_secs(3600),
        }
    }
}

/// Everything the pipeline needs besides the backend itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineSettings {
    pub limits: PipelineLimits,
    pub cache: CacheSettings,
    pub retry: RetryPolicy,
}

impl PipelineSettings {
    /// Reject limits that cannot work together.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let limits = &self.limits;
        if limits.max_file_size == 0 {
            return Err(PipelineError::configuration("max file size must be positive"));
        }
        if limits.preview_window < file_validator::longest_signature() {
            return Err(PipelineError::configuration(format!(
                "preview window must cover the longest file signature ({} bytes)",
                file_validator::longest_signature()
            )));
        }
        if limits.preview_window > file_validator::MAX_PREVIEW_BYTES
            || limits.preview_window as u64 > limits.max_file_size
        {
            return Err(PipelineError::configuration(
                "preview window must not exceed the max file size",
            ));
        }
        if limits.part_size == 0 || limits.max_in_flight_parts == 0 {
            return Err(PipelineError::configuration(
                "part size and in-flight parts must be positive",
            ));
        }
        if self.cache.capacity == 0 {
            return Err(PipelineError::configuration("url cache capacity must be positive"));
        }
        if self.cache.ttl >= self.cache.link_validity {
            return Err(PipelineError::configuration(
                "url cache ttl must be shorter than signed link validity",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::configuration("retry attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Where objects live.
#[derive(Clone)]
pub enum BackendSettings {
    S3(S3Settings),
    /// Process-local store for development; links are signed with a local key.
    ///
    /// The gateway does not serve these links. They point under
    /// `public_base_url` and only resolve if something mounted there checks
    /// the signature and serves the object; otherwise they are placeholders
    /// that identify the object in development and tests.
    Memory {
        public_base_url: Url,
        signing_secret: Vec<u8>,
    },
}

impl fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSettings::S3(s3) => f.debug_tuple("S3").field(s3).finish(),
            BackendSettings::Memory {
                public_base_url, ..
            } => f
                .debug_struct("Memory")
                .field("public_base_url", &public_base_url.as_str())
                .field("signing_secret", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, R2, ...).
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    S3,
    Memory,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(value, true)
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Secure upload gateway in front of an S3-compatible object store"
)]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend (overrides UPLOAD_GATEWAY_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// S3 bucket (overrides UPLOAD_GATEWAY_S3_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// S3 region (overrides UPLOAD_GATEWAY_S3_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// S3-compatible endpoint URL (overrides UPLOAD_GATEWAY_S3_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Base URL of links issued by the memory backend (overrides UPLOAD_GATEWAY_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Largest accepted upload in bytes (overrides UPLOAD_GATEWAY_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Bytes held for signature validation (overrides UPLOAD_GATEWAY_PREVIEW_WINDOW)
    #[arg(long)]
    pub preview_window: Option<usize>,

    /// Multipart part size in bytes (overrides UPLOAD_GATEWAY_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<usize>,

    /// Parts uploaded concurrently per object (overrides UPLOAD_GATEWAY_MAX_IN_FLIGHT_PARTS)
    #[arg(long)]
    pub max_in_flight_parts: Option<usize>,

    /// Validity of signed links in seconds (overrides UPLOAD_GATEWAY_LINK_VALIDITY_SECS)
    #[arg(long)]
    pub link_validity_secs: Option<u64>,

    /// How long signed links are cached, in seconds (overrides UPLOAD_GATEWAY_CACHE_TTL_SECS)
    #[arg(long)]
    pub cache_ttl_secs: Option<u64>,

    /// Maximum cached links (overrides UPLOAD_GATEWAY_CACHE_CAPACITY)
    #[arg(long)]
    pub cache_capacity: Option<usize>,

    /// Attempts per idempotent backend call (overrides UPLOAD_GATEWAY_RETRY_ATTEMPTS)
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// First retry delay in milliseconds (overrides UPLOAD_GATEWAY_RETRY_BASE_DELAY_MS)
    #[arg(long)]
    pub retry_base_delay_ms: Option<u64>,

    /// Cap for a single retry delay in milliseconds (overrides UPLOAD_GATEWAY_RETRY_MAX_DELAY_MS)
    #[arg(long)]
    pub retry_max_delay_ms: Option<u64>,

    /// Backend connect timeout in seconds (overrides UPLOAD_GATEWAY_CONNECT_TIMEOUT_SECS)
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,

    /// Backend request timeout in seconds (overrides UPLOAD_GATEWAY_REQUEST_TIMEOUT_SECS)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into a validated AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        // Parse CLI once
        let args = Args::parse();
        let cfg = Self::resolve(args, &|name| env::var(name).ok())?;
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }

    /// Merge CLI args over environment values over defaults.
    ///
    /// `env` looks up a full variable name.
    pub fn resolve(args: Args, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = PipelineSettings::default();

        let host = args
            .host
            .or(lookup(env, "HOST")?)
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = args.port.or(lookup(env, "PORT")?).unwrap_or(3000);

        let limits = PipelineLimits {
            max_file_size: args
                .max_file_size
                .or(lookup(env, "MAX_FILE_SIZE")?)
                .unwrap_or(defaults.limits.max_file_size),
            preview_window: args
                .preview_window
                .or(lookup(env, "PREVIEW_WINDOW")?)
                .unwrap_or(defaults.limits.preview_window),
            part_size: args
                .part_size
                .or(lookup(env, "PART_SIZE")?)
                .unwrap_or(defaults.limits.part_size),
            max_in_flight_parts: args
                .max_in_flight_parts
                .or(lookup(env, "MAX_IN_FLIGHT_PARTS")?)
                .unwrap_or(defaults.limits.max_in_flight_parts),
        };

        let cache = CacheSettings {
            capacity: args
                .cache_capacity
                .or(lookup(env, "CACHE_CAPACITY")?)
                .unwrap_or(defaults.cache.capacity),
            ttl: args
                .cache_ttl_secs
                .or(lookup(env, "CACHE_TTL_SECS")?)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache.ttl),
            link_validity: args
                .link_validity_secs
                .or(lookup(env, "LINK_VALIDITY_SECS")?)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache.link_validity),
        };

        let retry = RetryPolicy {
            max_attempts: args
                .retry_attempts
                .or(lookup(env, "RETRY_ATTEMPTS")?)
                .unwrap_or(defaults.retry.max_attempts),
            base_delay: args
                .retry_base_delay_ms
                .or(lookup(env, "RETRY_BASE_DELAY_MS")?)
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_delay: args
                .retry_max_delay_ms
                .or(lookup(env, "RETRY_MAX_DELAY_MS")?)
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
        };

        let kind = args
            .backend
            .or(lookup(env, "BACKEND")?)
            .unwrap_or(BackendKind::S3);
        let backend = match kind {
            BackendKind::S3 => BackendSettings::S3(S3Settings {
                bucket: args.bucket.or(lookup(env, "S3_BUCKET")?).context(
                    "an S3 bucket is required (--bucket or UPLOAD_GATEWAY_S3_BUCKET)",
                )?,
                region: args
                    .region
                    .or(lookup(env, "S3_REGION")?)
                    .unwrap_or_else(|| "us-east-1".into()),
                endpoint: args.endpoint.or(lookup(env, "S3_ENDPOINT")?),
                // credentials are never taken from the command line
                access_key_id: lookup(env, "S3_ACCESS_KEY_ID")?
                    .or_else(|| env("AWS_ACCESS_KEY_ID")),
                secret_access_key: lookup(env, "S3_SECRET_ACCESS_KEY")?
                    .or_else(|| env("AWS_SECRET_ACCESS_KEY")),
                connect_timeout: Duration::from_secs(
                    args.connect_timeout_secs
                        .or(lookup(env, "CONNECT_TIMEOUT_SECS")?)
                        .unwrap_or(5),
                ),
                request_timeout: Duration::from_secs(
                    args.request_timeout_secs
                        .or(lookup(env, "REQUEST_TIMEOUT_SECS")?)
                        .unwrap_or(30),
                ),
            }),
            BackendKind::Memory => {
                let raw = args
                    .public_base_url
                    .or(lookup(env, "PUBLIC_BASE_URL")?)
                    .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.into());
                let public_base_url = Url::parse(&raw)
                    .with_context(|| format!("parsing public base url `{}`", raw))?;
                let signing_secret = match lookup::<String>(env, "SIGNING_SECRET")? {
                    Some(secret) => secret.into_bytes(),
                    None => random_secret(),
                };
                BackendSettings::Memory {
                    public_base_url,
                    signing_secret,
                }
            }
        };

        Ok(Self {
            host,
            port,
            backend,
            pipeline: PipelineSettings {
                limits,
                cache,
                retry,
            },
        })
    }

    /// Check the merged settings before any traffic is accepted.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.pipeline.validate()?;

        match &self.backend {
            BackendSettings::S3(s3) => {
                if s3.bucket.trim().is_empty() {
                    return Err(PipelineError::configuration("S3 bucket must not be empty"));
                }
                if s3.access_key_id.is_some() != s3.secret_access_key.is_some() {
                    return Err(PipelineError::configuration(
                        "S3 access key id and secret access key must be set together",
                    ));
                }
                let limits = &self.pipeline.limits;
                if limits.part_size < MIN_PART_SIZE {
                    return Err(PipelineError::configuration(format!(
                        "S3 part size must be at least {MIN_PART_SIZE} bytes"
                    )));
                }
                if limits.max_file_size.div_ceil(limits.part_size as u64) > MAX_UPLOAD_PARTS {
                    return Err(PipelineError::configuration(format!(
                        "max file size needs more than {MAX_UPLOAD_PARTS} parts; raise the part size"
                    )));
                }
            }
            BackendSettings::Memory { signing_secret, .. } => {
                if signing_secret.is_empty() {
                    return Err(PipelineError::configuration("signing secret must not be empty"));
                }
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse `UPLOAD_GATEWAY_{name}`; absent or blank means unset.
fn lookup<T>(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let var = format!("{ENV_PREFIX}{name}");
    match env(&var) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow!("parsing {} value `{}`: {}", var, value, err)),
        _ => Ok(None),
    }
}

fn random_secret() -> Vec<u8> {
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}
