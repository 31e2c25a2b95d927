use common::domain::RateLimitPolicy;
use common::http::{HttpLoggingConfig, HttpServerConfig};
use common::telemetry::TelemetryConfig;
use config::{Config, ConfigError, Environment};
use heatline_api::domain::RateLimiterConfig;
use retention_worker::domain::RetentionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // HTTP configuration
    /// HTTP server host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTP path prefixes to ignore in request logging (comma-separated)
    #[serde(default = "default_http_ignored_paths")]
    pub http_ignored_paths: String,

    /// Largest accepted device request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Origins allowed on device endpoints (comma-separated, "*" for all)
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: String,

    /// Key per-IP rate limits on forwarding headers (only behind a trusted proxy)
    #[serde(default = "default_trust_forwarded_headers")]
    pub trust_forwarded_headers: bool,

    // Auth configuration
    /// Accepted clock skew for device timestamps, also the nonce lifetime
    #[serde(default = "default_auth_tolerance_secs")]
    pub auth_tolerance_secs: u64,

    /// Secret the opaque device lookup tokens are derived from
    #[serde(default = "default_device_token_secret")]
    pub device_token_secret: String,

    /// JWT secret shared with the session service
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    // Rate limit configuration
    /// Requests per minute per route and client IP
    #[serde(default = "default_rate_limit_ip_per_minute")]
    pub rate_limit_ip_per_minute: u32,

    /// Requests per minute per device (0 disables the device limit)
    #[serde(default = "default_rate_limit_device_per_minute")]
    pub rate_limit_device_per_minute: u32,

    /// How long an exhausted bucket stays blocked
    #[serde(default = "default_rate_limit_block_secs")]
    pub rate_limit_block_secs: u64,

    /// Timeout for each shared bucket store call before falling back
    #[serde(default = "default_rate_limit_store_timeout_ms")]
    pub rate_limit_store_timeout_ms: u64,

    /// How often idle in-memory buckets are dropped
    #[serde(default = "default_bucket_sweep_interval_secs")]
    pub bucket_sweep_interval_secs: u64,

    /// Idle time after which an in-memory bucket is dropped
    #[serde(default = "default_bucket_idle_secs")]
    pub bucket_idle_secs: u64,

    // NATS configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// NATS KV bucket holding shared rate-limit buckets
    #[serde(default = "default_nats_kv_bucket")]
    pub nats_kv_bucket: String,

    /// NATS Object Store bucket for retention archives (empty disables archiving)
    #[serde(default = "default_archive_bucket")]
    pub archive_bucket: String,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // PostgreSQL configuration
    /// PostgreSQL host
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    /// PostgreSQL port
    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    /// PostgreSQL database name
    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    /// PostgreSQL username
    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    /// PostgreSQL password
    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    /// PostgreSQL connection pool size
    #[serde(default = "default_postgres_max_pool_size")]
    pub postgres_max_pool_size: usize,

    // Telemetry store configuration
    /// Which sample wins the latest-state row ("received" or "sensed")
    #[serde(default = "default_latest_state_ordering")]
    pub latest_state_ordering: String,

    /// How often expired replay nonces are pruned
    #[serde(default = "default_nonce_sweep_interval_secs")]
    pub nonce_sweep_interval_secs: u64,

    // Retention configuration
    /// Rows older than this many days are purged (minimum 7)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Refuse to delete without an archive destination
    #[serde(default = "default_retention_backup_required")]
    pub retention_backup_required: bool,

    /// Object key prefix for retention archives
    #[serde(default = "default_retention_archive_prefix")]
    pub retention_archive_prefix: String,

    /// Rows fetched per retention batch
    #[serde(default = "default_retention_batch_size")]
    pub retention_batch_size: usize,

    /// Rows per delete statement
    #[serde(default = "default_retention_delete_chunk_size")]
    pub retention_delete_chunk_size: usize,

    /// Count eligible rows without archiving or deleting
    #[serde(default = "default_retention_dry_run")]
    pub retention_dry_run: bool,

    /// Batches per invocation across all tables (0 is unlimited)
    #[serde(default = "default_retention_max_batches_per_run")]
    pub retention_max_batches_per_run: usize,

    /// How often the retention job runs
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,

    // OpenTelemetry configuration
    /// OpenTelemetry OTLP endpoint (gRPC)
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    /// Enable OpenTelemetry export
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    /// Service name for OpenTelemetry resource
    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    /// Fraction of traces exported
    #[serde(default = "default_trace_sample_ratio")]
    pub trace_sample_ratio: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

// HTTP defaults
fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_http_ignored_paths() -> String {
    "/healthz".to_string()
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_allowed_origins() -> String {
    "*".to_string()
}

fn default_trust_forwarded_headers() -> bool {
    false
}

// Auth defaults
fn default_auth_tolerance_secs() -> u64 {
    300
}

fn default_device_token_secret() -> String {
    "change-me-in-production-device-tokens".to_string()
}

fn default_jwt_secret() -> String {
    "change-me-in-production".to_string()
}

// Rate limit defaults
fn default_rate_limit_ip_per_minute() -> u32 {
    120
}

fn default_rate_limit_device_per_minute() -> u32 {
    60
}

fn default_rate_limit_block_secs() -> u64 {
    60
}

fn default_rate_limit_store_timeout_ms() -> u64 {
    250
}

fn default_bucket_sweep_interval_secs() -> u64 {
    60
}

fn default_bucket_idle_secs() -> u64 {
    600
}

// NATS defaults
fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_kv_bucket() -> String {
    "heatline-rate-limits".to_string()
}

fn default_archive_bucket() -> String {
    String::new()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

// PostgreSQL defaults
fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "heatline".to_string()
}

fn default_postgres_username() -> String {
    "heatline".to_string()
}

fn default_postgres_password() -> String {
    "heatline".to_string()
}

fn default_postgres_max_pool_size() -> usize {
    10
}

// Telemetry store defaults
fn default_latest_state_ordering() -> String {
    "received".to_string()
}

fn default_nonce_sweep_interval_secs() -> u64 {
    300
}

// Retention defaults
fn default_retention_days() -> u32 {
    90
}

fn default_retention_backup_required() -> bool {
    true
}

fn default_retention_archive_prefix() -> String {
    "retention".to_string()
}

fn default_retention_batch_size() -> usize {
    250
}

fn default_retention_delete_chunk_size() -> usize {
    50
}

fn default_retention_dry_run() -> bool {
    false
}

fn default_retention_max_batches_per_run() -> usize {
    0
}

fn default_retention_interval_secs() -> u64 {
    3600
}

// OpenTelemetry defaults
fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_service_name() -> String {
    "heatline-all-in-one".to_string()
}

fn default_trace_sample_ratio() -> f64 {
    1.0
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("HEATLINE"))
            .build()?
            .try_deserialize()
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            trace_sample_ratio: self.trace_sample_ratio,
            log_level: self.log_level.clone(),
        }
    }

    pub fn http_server_config(&self) -> HttpServerConfig {
        let ignored_paths: Vec<String> = self
            .http_ignored_paths
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        HttpServerConfig {
            host: self.http_host.clone(),
            port: self.http_port,
            logging_config: HttpLoggingConfig::new(ignored_paths),
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        let device_policy = (self.rate_limit_device_per_minute > 0).then(|| {
            RateLimitPolicy::per_minute(self.rate_limit_device_per_minute, self.rate_limit_block_secs)
        });

        RateLimiterConfig {
            ip_policy: RateLimitPolicy::per_minute(
                self.rate_limit_ip_per_minute,
                self.rate_limit_block_secs,
            ),
            device_policy,
            store_timeout: Duration::from_millis(self.rate_limit_store_timeout_ms),
        }
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            retention_days: self.retention_days,
            backup_required: self.retention_backup_required,
            archive_prefix: self.retention_archive_prefix.clone(),
            batch_size: self.retention_batch_size,
            delete_chunk_size: self.retention_delete_chunk_size,
            dry_run: self.retention_dry_run,
            max_batches_per_run: self.retention_max_batches_per_run,
        }
    }
}
