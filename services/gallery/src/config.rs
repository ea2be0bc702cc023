use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the gallery service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Upload workflow configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// HTTP API configuration
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
    /// Debug mode: human-readable logs at debug level
    #[serde(default)]
    pub debug: bool,
    /// Start the Prometheus exporter
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for uploaded images
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL used for non-expiring object links; derived from bucket and region when unset
    pub public_base_url: Option<String>,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
///
/// Either `url` or `secret_id` must be set. When both are present the URL wins.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// MySQL connection URL, bypasses Secrets Manager
    pub url: Option<String>,
    /// Secrets Manager secret holding `host`, `username`, `password` and `dbname`
    pub secret_id: Option<String>,
    /// Region of the secret; defaults to the S3 region
    pub secret_region: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default)]
    pub min_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Create the captions table on startup (local development only)
    #[serde(default)]
    pub run_migrations: bool,
}

/// Upload workflow configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Prefix of every storage key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Accepted file extensions, compared case-insensitively
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Largest accepted request body
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Delay between caption lookups in milliseconds
    #[serde(default = "default_caption_poll_interval_ms")]
    pub caption_poll_interval_ms: u64,
    /// Total caption wait in seconds
    #[serde(default = "default_caption_wait_timeout_secs")]
    pub caption_wait_timeout_secs: u64,
    /// Keep polling after a database error instead of giving up
    #[serde(default)]
    pub retry_on_poll_error: bool,
    /// Append a random token to storage keys so equal filenames never collide
    #[serde(default)]
    pub unique_keys: bool,
    /// Return the uploaded bytes base64-encoded in the upload response
    #[serde(default = "default_true")]
    pub echo_image: bool,
    /// Caption reported while the worker has not produced one
    #[serde(default = "default_placeholder_caption")]
    pub placeholder_caption: String,
}

/// HTTP API configuration
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
    /// Pass storage and database error messages through to clients
    #[serde(default = "default_true")]
    pub expose_error_details: bool,
}

// Default value functions
fn default_service_name() -> String {
    "gallery-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_key_prefix() -> String {
    "uploads".to_string()
}

fn default_allowed_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "gif"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_upload_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_caption_poll_interval_ms() -> u64 {
    1000
}

fn default_caption_wait_timeout_secs() -> u64 {
    10
}

fn default_placeholder_caption() -> String {
    "Waiting for caption...".to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/gallery").required(false))
            .add_source(config::File::with_name("/etc/gallery/gallery").required(false))
            // Override with environment variables
            // GALLERY__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("GALLERY")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would only fail later, at request time
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("s3.bucket".to_string()));
        }

        if self.database.url.is_none() && self.database.secret_id.is_none() {
            return Err(ConfigError::MissingRequired(
                "database.url or database.secret_id".to_string(),
            ));
        }

        if self.upload.caption_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "upload.caption_poll_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.upload.allowed_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "upload.allowed_extensions".to_string(),
                message: "at least one extension is required".to_string(),
            });
        }

        if self.s3.part_size_bytes < 5 * 1024 * 1024 {
            return Err(ConfigError::InvalidValue {
                key: "s3.part_size_bytes".to_string(),
                message: "S3 requires parts of at least 5MB".to_string(),
            });
        }

        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }

    /// Region used for the database secret
    pub fn secret_region(&self) -> &str {
        self.database
            .secret_region
            .as_deref()
            .unwrap_or(&self.s3.region)
    }
}

impl UploadConfig {
    /// Delay between caption lookups
    pub fn caption_poll_interval(&self) -> Duration {
        Duration::from_millis(self.caption_poll_interval_ms)
    }

    /// Upper bound of the caption wait
    pub fn caption_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.caption_wait_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            debug: false,
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret_id: None,
            secret_region: None,
            max_connections: default_max_connections(),
            min_connections: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            allowed_extensions: default_allowed_extensions(),
            max_upload_bytes: default_max_upload_bytes(),
            caption_poll_interval_ms: default_caption_poll_interval_ms(),
            caption_wait_timeout_secs: default_caption_wait_timeout_secs(),
            retry_on_poll_error: false,
            unique_keys: false,
            echo_image: true,
            placeholder_caption: default_placeholder_caption(),
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
            expose_error_details: true,
        }
    }
}
