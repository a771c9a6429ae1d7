//! Configuration for the WaveVault ingestion service

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Default tracing filter (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

/// Object-store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// S3 endpoint URL (MinIO, LocalStack, or custom S3-compatible
    /// services). If not specified, uses the AWS default endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Public host for presigned URLs that should ride the CDN.
    #[serde(default)]
    pub public_endpoint: Option<String>,

    /// Scheme for the public endpoint
    #[serde(default = "default_public_scheme")]
    pub public_scheme: String,

    /// Bucket recordings land in
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Use path-style URLs (required for MinIO, LocalStack)
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,

    /// Access key (optional, can use env/instance credentials)
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Secret key (optional, can use env/instance credentials)
    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Payloads above this many MiB presign against the direct endpoint
    /// (bypassing CDN upload caps)
    #[serde(default = "default_large_file_threshold_mib")]
    pub large_file_threshold_mib: u64,

    /// Concurrent parts per multipart upload
    #[serde(default = "default_parts_in_flight")]
    pub parts_in_flight: usize,

    /// Origins allowed by the bucket CORS rules
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

/// Ingest pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Spliced into stored names: `sermon.wav` -> `sermon_raw.wav`
    #[serde(default = "default_suffix")]
    pub suffix: String,

    /// Batches larger than this run through the worker pool instead of
    /// sequentially
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,

    /// Read size for the hash and upload passes
    #[serde(default = "default_io_buffer_size")]
    pub io_buffer_size: usize,

    /// Emit a progress event at most once per this many bytes
    #[serde(default = "default_progress_interval_bytes")]
    pub progress_interval_bytes: u64,

    /// Upper bound on pool workers
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// Largest accepted payload in bytes
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,

    /// Per-item timeout on pool work
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
}

/// Rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_upload_rate")]
    pub upload_rate: f64,
    #[serde(default = "default_upload_burst")]
    pub upload_burst: f64,
    #[serde(default = "default_hash_rate")]
    pub hash_rate: f64,
    #[serde(default = "default_hash_burst")]
    pub hash_burst: f64,
    #[serde(default = "default_api_rate")]
    pub api_rate: f64,
    #[serde(default = "default_api_burst")]
    pub api_burst: f64,

    /// Revisit rates on a cadence using memory + denial ratio
    #[serde(default = "default_true")]
    pub adaptive_enabled: bool,

    /// Adaptive cadence; clamped to >= 30 s at runtime
    #[serde(default = "default_adaptive_interval_secs")]
    pub adaptive_interval_secs: u64,
}

/// Memory throttling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Soft cap in MiB. 0 means 80% of available memory, sampled at
    /// startup.
    #[serde(default)]
    pub soft_cap_mib: u64,

    /// Hard cap in MiB; the watchdog pauses intake above it
    #[serde(default = "default_hard_cap_mib")]
    pub hard_cap_mib: u64,

    #[serde(default = "default_true")]
    pub throttle_enabled: bool,

    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    #[serde(default = "default_half_open_max")]
    pub half_open_max: u32,
}

/// Resumable session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Non-verified sessions older than this are swept
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,

    /// Scratch directory for in-flight session bytes. Created owner-only.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Store retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

// Default value functions for serde
fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

fn default_log_level() -> String {
    "wavevault=debug,tower_http=debug".to_string()
}

fn default_public_scheme() -> String {
    "https".to_string()
}

fn default_bucket() -> String {
    "recordings".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_large_file_threshold_mib() -> u64 {
    100
}

fn default_parts_in_flight() -> usize {
    10
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_suffix() -> String {
    "_raw".to_string()
}

fn default_batch_threshold() -> usize {
    2
}

fn default_io_buffer_size() -> usize {
    256 * 1024
}

fn default_progress_interval_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_max_concurrent_uploads() -> usize {
    4
}

fn default_max_upload_size() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

fn default_item_timeout_secs() -> u64 {
    120
}

fn default_upload_rate() -> f64 {
    2.0
}

fn default_upload_burst() -> f64 {
    2.0
}

fn default_hash_rate() -> f64 {
    10.0
}

fn default_hash_burst() -> f64 {
    5.0
}

fn default_api_rate() -> f64 {
    20.0
}

fn default_api_burst() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_adaptive_interval_secs() -> u64 {
    30
}

fn default_hard_cap_mib() -> u64 {
    800
}

fn default_watchdog_interval_secs() -> u64 {
    10
}

fn default_max_failures() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    30
}

fn default_half_open_max() -> u32 {
    3
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_scratch_dir() -> String {
    "./scratch".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_secs() -> u64 {
    1
}

fn default_max_backoff_secs() -> u64 {
    30
}

macro_rules! impl_section_default {
    ($($section:ty),+) => {
        $(impl Default for $section {
            fn default() -> Self {
                // Every field either has a serde default fn or is Option
                toml::from_str("").expect("section defaults are total")
            }
        })+
    };
}

impl_section_default!(
    Config,
    StoreConfig,
    IngestConfig,
    LimitsConfig,
    MemoryConfig,
    BreakerSettings,
    SessionSettings,
    RetrySettings
);

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("WAVEVAULT_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }
        if let Ok(endpoint) = std::env::var("WAVEVAULT_S3_ENDPOINT") {
            config.store.endpoint = Some(endpoint);
        }
        if let Ok(bucket) = std::env::var("WAVEVAULT_S3_BUCKET") {
            config.store.bucket = bucket;
        }
        if let Ok(region) = std::env::var("WAVEVAULT_S3_REGION") {
            config.store.region = region;
        }
        if let Ok(v) = std::env::var("WAVEVAULT_S3_FORCE_PATH_STYLE") {
            config.store.force_path_style = v == "true" || v == "1";
        }
        if let Ok(host) = std::env::var("WAVEVAULT_S3_PUBLIC_ENDPOINT") {
            config.store.public_endpoint = Some(host);
        }
        config.store.access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok();
        config.store.secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok();

        if let Ok(dir) = std::env::var("WAVEVAULT_SCRATCH_DIR") {
            config.session.scratch_dir = dir;
        }
        if let Ok(suffix) = std::env::var("WAVEVAULT_SUFFIX") {
            config.ingest.suffix = suffix;
        }
        if let Ok(size) = std::env::var("WAVEVAULT_MAX_UPLOAD_SIZE") {
            if let Ok(parsed) = size.parse() {
                config.ingest.max_upload_size = parsed;
            }
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from
    /// environment
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("WAVEVAULT_CONFIG") {
            if let Ok(config) = Self::from_file(&path) {
                return config;
            }
        }

        for path in &["wavevault.toml", "/etc/wavevault/config.toml"] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }

        Self::from_env()
    }

    // === Typed views for component constructors ===

    pub fn breaker_config(&self) -> crate::breaker::BreakerConfig {
        crate::breaker::BreakerConfig {
            max_failures: self.breaker.max_failures,
            reset_timeout: Duration::from_secs(self.breaker.reset_timeout_secs),
            half_open_max: self.breaker.half_open_max,
        }
    }

    pub fn retry_policy(&self) -> crate::storage::retry::RetryPolicy {
        crate::storage::retry::RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_secs(self.retry.initial_backoff_secs),
            max_backoff: Duration::from_secs(self.retry.max_backoff_secs),
        }
    }

    pub fn rate_limits(&self) -> crate::ratelimit::RateLimits {
        crate::ratelimit::RateLimits {
            upload_rate: self.limits.upload_rate,
            upload_burst: self.limits.upload_burst,
            hash_rate: self.limits.hash_rate,
            hash_burst: self.limits.hash_burst,
            api_rate: self.limits.api_rate,
            api_burst: self.limits.api_burst,
        }
    }

    /// Pool config. With no explicit soft cap, 80% of the available memory
    /// observed at startup becomes the throttle threshold.
    pub fn pool_config(&self, available_bytes: u64) -> crate::workers::PoolConfig {
        let soft_cap_bytes = if self.memory.soft_cap_mib > 0 {
            self.memory.soft_cap_mib * 1024 * 1024
        } else {
            available_bytes - available_bytes / 5
        };
        crate::workers::PoolConfig {
            max_workers: self.ingest.max_concurrent_uploads,
            item_timeout: Duration::from_secs(self.ingest.item_timeout_secs),
            soft_cap_bytes,
            throttle_enabled: self.memory.throttle_enabled,
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_secs)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
