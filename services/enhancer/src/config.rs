//! Configuration management for the enhancer service.
//!
//! Configuration is layered: built-in defaults, then optional config files,
//! then environment variables prefixed with `ENHANCER`.

use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the enhancer service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Remote enhancement API configuration
    #[serde(default)]
    pub enhancement: EnhancementConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Archive download configuration
    #[serde(default)]
    pub archive: ArchiveConfig,
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
    /// Output format (json, compact)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Remote enhancement API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EnhancementConfig {
    /// API credential. Falls back to the `API_KEY` / `GEMINI_API_KEY`
    /// environment variables when unset.
    pub api_key: Option<String>,
    /// Base URL of the generative API
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Image-capable model name
    #[serde(default = "default_model")]
    pub model: String,
    /// Instruction sent alongside every image
    #[serde(default = "default_instruction")]
    pub instruction: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
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
    /// Maximum accepted request body for uploads, in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Archive configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// File name offered for the batch download
    #[serde(default = "default_archive_file_name")]
    pub file_name: String,
}

// Default value functions
fn default_service_name() -> String {
    "enhancer-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

pub(crate) fn default_instruction() -> String {
    "Enhance this image: increase sharpness and resolution, remove blur and \
     compression artifacts, and boost vibrance naturally. Return only the enhanced image."
        .to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_max_upload_bytes() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_archive_file_name() -> String {
    "enhanced-images.zip".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            instruction: default_instruction(),
            request_timeout_secs: default_request_timeout_secs(),
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
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            file_name: default_archive_file_name(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            enhancement: EnhancementConfig::default(),
            api: ApiConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from config files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/enhancer.{toml,yaml,json}`
    /// 2. `/etc/enhancer/enhancer.{toml,yaml,json}`
    /// 3. Environment variables, e.g. `ENHANCER__ENHANCEMENT__API_KEY`
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "enhancer-service")?
            .set_default("service.log_level", "info")?
            .add_source(config::File::with_name("config/enhancer").required(false))
            .add_source(config::File::with_name("/etc/enhancer/enhancer").required(false))
            // ENHANCER__API__PORT -> api.port
            .add_source(
                config::Environment::with_prefix("ENHANCER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.enhancement.base_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "enhancement.base_url".to_string(),
            ));
        }
        if !self.enhancement.base_url.starts_with("http://")
            && !self.enhancement.base_url.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "enhancement.base_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }
        if self.enhancement.model.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "enhancement.model".to_string(),
            ));
        }
        if self.enhancement.request_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "enhancement.request_timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }
        if self.api.max_upload_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_upload_bytes".to_string(),
                message: "Upload limit must be greater than 0".to_string(),
            });
        }
        if self.archive.file_name.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "archive.file_name".to_string(),
            ));
        }

        Ok(())
    }
}

impl EnhancementConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
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
