use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Main configuration for the media pipeline service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database (system of record) configuration
    pub database: DatabaseConfig,
    /// S3 configuration for owned media storage
    pub s3: S3Config,
    /// Tiered cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Migration state machine configuration
    #[serde(default)]
    pub migration: MigrationConfig,
    /// Thumbnail derivation configuration
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
    /// Trigger dispatcher and reconciliation configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Admission control configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// How often configuration sources are re-read for hot-reloadable values
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for owned media
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, R2, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL objects are served from; defaults to the virtual-hosted bucket URL
    pub public_base_url: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Tiered cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// L1 (in-process) TTL in seconds
    #[serde(default = "default_l1_ttl_secs")]
    pub l1_ttl_secs: u64,
    /// L2 (node-local store) TTL in seconds
    #[serde(default = "default_l2_ttl_secs")]
    pub l2_ttl_secs: u64,
    /// L3 (distributed) TTL in seconds
    #[serde(default = "default_l3_ttl_secs")]
    pub l3_ttl_secs: u64,
    /// Maximum number of L1 entries before recency eviction
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,
    /// Interval of the optional L1 expiry sweep; 0 leaves expiry to reads
    #[serde(default = "default_l1_sweep_interval_secs")]
    pub l1_sweep_interval_secs: u64,
    /// Path of the SQLite file backing L2
    #[serde(default = "default_local_store_path")]
    pub local_store_path: String,
    /// Redis URL for L3; L3 is disabled when unset
    pub redis_url: Option<String>,
    /// Redis round-trip timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,
    /// After an L3 failure, skip L3 for this many seconds before probing again
    #[serde(default = "default_redis_retry_after_secs")]
    pub redis_retry_after_secs: u64,
    /// Redis connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub redis_pool_size: usize,
}

/// Migration state machine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Attempts before an asset becomes permanently failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    /// Origin download timeout in seconds
    #[serde(default = "default_transfer_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Object storage upload timeout in seconds
    #[serde(default = "default_transfer_timeout_secs")]
    pub upload_timeout_secs: u64,
    /// Refuse origin payloads larger than this (bytes)
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
}

/// Thumbnail derivation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailConfig {
    /// Target width in pixels
    #[serde(default = "default_thumbnail_width")]
    pub width: u32,
    /// Target height in pixels
    #[serde(default = "default_thumbnail_height")]
    pub height: u32,
    /// JPEG quality scale passed to the encoder (2 = best, 31 = worst)
    #[serde(default = "default_thumbnail_quality")]
    pub quality: u32,
    /// Position in the video the frame is taken from
    #[serde(default = "default_seek_secs")]
    pub seek_secs: f64,
    /// Retries for transient failures
    #[serde(default = "default_thumbnail_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Timeout for a single extraction in seconds
    #[serde(default = "default_thumbnail_timeout_secs")]
    pub timeout_secs: u64,
    /// ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
}

/// Trigger dispatcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Buffered events before `notify` starts dropping
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Concurrent downstream calls
    #[serde(default = "default_dispatch_concurrency")]
    pub concurrency: usize,
    /// Timeout for one downstream call in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Reconciliation sweep interval in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Age after which pending or in-flight assets count as stuck
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Base delay for retrying failed migrations, doubled per attempt
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    /// Maximum assets handled per sweep category
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: i64,
    /// Failed derivations after which the sweep stops re-triggering an asset
    #[serde(default = "default_max_derivation_failures")]
    pub max_derivation_failures: i32,
    /// Postgres NOTIFY channel carrying asset events
    #[serde(default = "default_listen_channel")]
    pub listen_channel: String,
    /// When set, downstream calls go over HTTP to this pipeline instead of in-process
    pub remote_base_url: Option<String>,
}

/// Admission control configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Multiple of `max_requests` that escalates to a hard block
    #[serde(default = "default_escalation_factor")]
    pub escalation_factor: f64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "media-pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_reload_interval_secs() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_l1_ttl_secs() -> u64 {
    60
}

fn default_l2_ttl_secs() -> u64 {
    300
}

fn default_l3_ttl_secs() -> u64 {
    900
}

fn default_l1_capacity() -> usize {
    10_000
}

fn default_l1_sweep_interval_secs() -> u64 {
    60
}

fn default_local_store_path() -> String {
    "data/cache.sqlite".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    250
}

fn default_redis_retry_after_secs() -> u64 {
    15
}

fn default_redis_pool_size() -> usize {
    16
}

fn default_max_attempts() -> i32 {
    5
}

fn default_transfer_timeout_secs() -> u64 {
    60
}

fn default_max_download_bytes() -> u64 {
    2 * 1024 * 1024 * 1024 // 2GB
}

fn default_thumbnail_width() -> u32 {
    640
}

fn default_thumbnail_height() -> u32 {
    360
}

fn default_thumbnail_quality() -> u32 {
    3
}

fn default_seek_secs() -> f64 {
    1.0
}

fn default_thumbnail_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_thumbnail_timeout_secs() -> u64 {
    30
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_dispatch_concurrency() -> usize {
    8
}

fn default_call_timeout_secs() -> u64 {
    180
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_stale_after_secs() -> u64 {
    600
}

fn default_retry_base_secs() -> u64 {
    30
}

fn default_sweep_batch() -> i64 {
    100
}

fn default_max_derivation_failures() -> i32 {
    3
}

fn default_listen_channel() -> String {
    "media_asset_events".to_string()
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_escalation_factor() -> f64 {
    1.5
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/media-pipeline").required(false))
            .add_source(config::File::with_name("/etc/media-pipeline/config").required(false))
            // Override with environment variables
            // MEDIA__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("MEDIA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that break the pipeline's ownership rules.
    pub fn validate(&self) -> anyhow::Result<()> {
        // An owner may hold an asset for a download plus an upload and its
        // verification. Expiring it sooner lets two workers transfer at once.
        let longest_attempt =
            self.migration.download_timeout() + 2 * self.migration.upload_timeout();
        anyhow::ensure!(
            self.dispatcher.stale_after() > longest_attempt,
            "dispatcher.stale_after_secs ({}) must exceed the longest migration attempt ({}s)",
            self.dispatcher.stale_after_secs,
            longest_attempt.as_secs()
        );
        anyhow::ensure!(
            self.dispatcher.max_derivation_failures > 0,
            "dispatcher.max_derivation_failures must be positive"
        );
        Ok(())
    }

    /// Values that may change without a restart
    pub fn tunables(&self) -> Tunables {
        Tunables {
            rate_limit: self.rate_limit.clone(),
            max_migration_attempts: self.migration.max_attempts,
            thumbnail_max_retries: self.thumbnail.max_retries,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl CacheConfig {
    /// `None` when the periodic L1 sweep is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.l1_sweep_interval_secs > 0).then(|| Duration::from_secs(self.l1_sweep_interval_secs))
    }

    pub fn l1_ttl(&self) -> Duration {
        Duration::from_secs(self.l1_ttl_secs)
    }

    pub fn l2_ttl(&self) -> Duration {
        Duration::from_secs(self.l2_ttl_secs)
    }

    pub fn l3_ttl(&self) -> Duration {
        Duration::from_secs(self.l3_ttl_secs)
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }
}

impl MigrationConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

impl DispatcherConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            reload_interval_secs: default_reload_interval_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_ttl_secs: default_l1_ttl_secs(),
            l2_ttl_secs: default_l2_ttl_secs(),
            l3_ttl_secs: default_l3_ttl_secs(),
            l1_capacity: default_l1_capacity(),
            l1_sweep_interval_secs: default_l1_sweep_interval_secs(),
            local_store_path: default_local_store_path(),
            redis_url: None,
            redis_timeout_ms: default_redis_timeout_ms(),
            redis_retry_after_secs: default_redis_retry_after_secs(),
            redis_pool_size: default_redis_pool_size(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            download_timeout_secs: default_transfer_timeout_secs(),
            upload_timeout_secs: default_transfer_timeout_secs(),
            max_download_bytes: default_max_download_bytes(),
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            width: default_thumbnail_width(),
            height: default_thumbnail_height(),
            quality: default_thumbnail_quality(),
            seek_secs: default_seek_secs(),
            max_retries: default_thumbnail_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            timeout_secs: default_thumbnail_timeout_secs(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            concurrency: default_dispatch_concurrency(),
            call_timeout_secs: default_call_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            retry_base_secs: default_retry_base_secs(),
            sweep_batch: default_sweep_batch(),
            max_derivation_failures: default_max_derivation_failures(),
            listen_channel: default_listen_channel(),
            remote_base_url: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            escalation_factor: default_escalation_factor(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Hot-reloadable subset of the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub rate_limit: RateLimitConfig,
    pub max_migration_attempts: i32,
    pub thumbnail_max_retries: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            max_migration_attempts: default_max_attempts(),
            thumbnail_max_retries: default_thumbnail_retries(),
        }
    }
}

impl Tunables {
    /// A receiver that always yields these values.
    pub fn fixed(self) -> watch::Receiver<Tunables> {
        let (_tx, rx) = watch::channel(self);
        rx
    }
}

/// Periodically re-reads configuration sources and publishes changed tunables.
pub struct ConfigWatcher {
    tx: watch::Sender<Tunables>,
    interval: Duration,
}

impl ConfigWatcher {
    pub fn new(config: &Config) -> Self {
        let (tx, _rx) = watch::channel(config.tunables());
        Self {
            tx,
            interval: Duration::from_secs(config.service.reload_interval_secs.max(1)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Tunables> {
        self.tx.subscribe()
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match Config::load() {
                Ok(config) => self.publish(config.tunables()),
                Err(e) => warn!(error = %e, "Failed to reload configuration, keeping previous values"),
            }
        }
    }

    fn publish(&self, next: Tunables) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });

        if changed {
            info!(tunables = ?next, "Configuration reloaded");
        } else {
            debug!("Configuration unchanged");
        }
    }
}
