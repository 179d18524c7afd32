use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the diagnosis store service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Local storage layout
    #[serde(default)]
    pub storage: StorageConfig,
    /// Remote mirror configuration
    #[serde(default)]
    pub remote: RemoteConfig,
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
}

/// Local storage layout: `{root_dir}/{images_dir}/<id>.<ext>` and `{root_dir}/{records_file}`
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root storage directory
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Image subdirectory, relative to the root
    #[serde(default = "default_images_dir")]
    pub images_dir: String,
    /// Metadata file, relative to the root
    #[serde(default = "default_records_file")]
    pub records_file: String,
    /// Extension given to every stored image
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
}

/// Which remote store the mirror writes to
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    /// Supabase/PostgREST table insert over HTTPS
    #[default]
    Rest,
    /// Direct Postgres connection
    Postgres,
}

/// Remote mirror configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub backend: RemoteBackend,
    /// Project URL for the REST backend
    pub url: Option<String>,
    /// API key for the REST backend
    pub key: Option<String>,
    /// Target table
    #[serde(default = "default_table")]
    pub table: String,
    /// Postgres connection URL for the postgres backend
    pub database_url: Option<String>,
    /// REST request timeout in seconds (0 = wait indefinitely)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum number of pooled Postgres connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Postgres connect/acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Create the mirror table on startup (postgres backend only)
    #[serde(default)]
    pub run_migrations: bool,
}

/// API configuration for the ingest endpoint
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
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body, base64 image included
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "diagnosis-store".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./data_store")
}

fn default_images_dir() -> String {
    "images".to_string()
}

fn default_records_file() -> String {
    "records.json".to_string()
}

fn default_image_extension() -> String {
    "jpg".to_string()
}

fn default_table() -> String {
    "diagnoses".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    20 * 1024 * 1024 // 20MB
}

/// Read a plain environment variable, treating empty values as unset
fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(
                config::File::with_name("config/diagnosis-store")
                    .required(false)
            )
            .add_source(
                config::File::with_name("/etc/diagnosis-store/diagnosis-store")
                    .required(false)
            )
            // Override with environment variables
            // DIAGNOSIS_STORE__API__PORT -> api.port
            .add_source(
                config::Environment::with_prefix("DIAGNOSIS_STORE")
                    .separator("__")
                    .try_parsing(true)
            )
            // Conventional credential variables win over everything else
            .set_override_option("remote.url", non_empty_env("SUPABASE_URL"))?
            .set_override_option("remote.key", non_empty_env("SUPABASE_KEY"))?
            .set_override_option("remote.database_url", non_empty_env("DATABASE_URL"))?
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.root_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.root_dir".to_string(),
            ));
        }

        if self.storage.images_dir.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.images_dir".to_string(),
            ));
        }

        if self.storage.records_file.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.records_file".to_string(),
            ));
        }

        let ext = &self.storage.image_extension;
        if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.image_extension".to_string(),
                message: format!("'{}' is not a plain file extension", ext),
            });
        }

        if !is_sql_identifier(&self.remote.table) {
            return Err(ConfigValidationError::InvalidValue {
                field: "remote.table".to_string(),
                message: format!("'{}' is not a valid table name", self.remote.table),
            });
        }

        if self.api.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }

        if let Some(origin) = self
            .api
            .cors_origins
            .iter()
            .find(|o| o.parse::<axum::http::HeaderValue>().is_err())
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.cors_origins".to_string(),
                message: format!("'{}' is not a valid origin header value", origin.escape_debug()),
            });
        }

        if self.api.max_body_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_body_bytes".to_string(),
                message: "Body limit must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl StorageConfig {
    /// Directory holding one image file per record
    pub fn images_path(&self) -> PathBuf {
        self.root_dir.join(&self.images_dir)
    }

    /// File holding the full ordered record collection
    pub fn records_path(&self) -> PathBuf {
        self.root_dir.join(&self.records_file)
    }
}

impl RemoteConfig {
    /// Get REST request timeout as Duration, `None` when disabled
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Get Postgres connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// REST credentials, if both halves are present
    pub fn rest_credentials(&self) -> Option<(&str, &str)> {
        match (self.url.as_deref(), self.key.as_deref()) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => Some((url, key)),
            _ => None,
        }
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            images_dir: default_images_dir(),
            records_file: default_records_file(),
            image_extension: default_image_extension(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::default(),
            url: None,
            key: None,
            table: default_table(),
            database_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            run_migrations: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
