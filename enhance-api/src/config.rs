//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `ENHANCE_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`, may be absent)
//! 2. **Environment variables** - Variables prefixed with `ENHANCE_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `ENHANCE_MODEL__DEVICE=cpu` sets the `model.device` field.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use enhance_api::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//!
//! println!("Server will bind to {}:{}", config.host, config.port);
//! # Ok(())
//! # }
//! ```
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! ENHANCE_PORT=9000
//! ENHANCE_MODEL__PATH=/models/BSRGAN.onnx
//! ENHANCE_STORAGE__TEMP_DIR=/var/tmp/enhance
//! ENHANCE_LIMITS__ENHANCEMENTS__MAX_CONCURRENT=2
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "ENHANCE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty (or missing) config file yields a runnable service as
/// long as the model weights exist at the default path.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Super-resolution model settings
    pub model: ModelConfig,
    /// Temp file handling
    pub storage: StorageConfig,
    /// Upload validation
    pub uploads: UploadConfig,
    /// CORS settings for browser clients
    pub cors: CorsConfig,
    /// Admission control for the inference step
    pub limits: LimitsConfig,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

/// Where the weights live and how they are executed.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Path to the ONNX export of the network, relative to the working directory
    pub path: PathBuf,
    /// Execution device selection
    pub device: Device,
    /// Fixed upscale factor of the network. Every output is checked against it.
    pub scale_factor: u32,
    /// Optional BLAKE3 hex digest of the weight file, verified at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Run a warm-up inference on a small image at startup
    pub validate_on_startup: bool,
    /// Number of intra-op threads for the CPU execution provider (runtime default if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intra_threads: Option<usize>,
}

/// Execution device for the inference session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Use CUDA when the provider is available, otherwise the CPU
    #[default]
    Auto,
    /// Always use the CPU
    Cpu,
    /// Require CUDA; startup fails if it cannot be registered
    Cuda,
}

/// Temp file configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory where uploads are staged and outputs written. Created at startup.
    pub temp_dir: PathBuf,
    /// Inserted between the input's stem and the output extension
    pub output_suffix: String,
    /// Keep enhanced files on disk after they have been sent
    pub keep_outputs: bool,
    /// Remove stale staged uploads left behind by a previous run
    pub sweep_on_startup: bool,
}

/// Upload validation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Maximum upload size in bytes. 0 = unlimited.
    pub max_file_size: u64,
    /// Answer unsupported file types with `415` instead of `200`.
    /// The JSON body is the same either way.
    pub reject_unsupported_with_client_error: bool,
}

/// CORS (Cross-Origin Resource Sharing) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests
    pub allowed_origins: Vec<CorsOrigin>,
    /// Allow credentials (cookies) in CORS requests
    pub allow_credentials: bool,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

/// Resource limits for protecting inference capacity.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub enhancements: EnhanceLimitsConfig,
}

/// Concurrency limits for the enhancement step.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnhanceLimitsConfig {
    /// Maximum number of enhancements running at once. 0 = unlimited.
    pub max_concurrent: usize,
    /// Maximum number of requests waiting for a slot before new ones get HTTP 429.
    /// 0 = unlimited waiting queue.
    pub max_waiting: usize,
    /// Maximum time to wait for a slot before returning HTTP 429. Zero rejects immediately.
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            model: ModelConfig::default(),
            storage: StorageConfig::default(),
            uploads: UploadConfig::default(),
            cors: CorsConfig::default(),
            limits: LimitsConfig::default(),
            enable_metrics: false,
            enable_otel_export: false,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("BSRGAN").join("models").join("BSRGAN.onnx"),
            device: Device::Auto,
            scale_factor: 4,
            checksum: None,
            validate_on_startup: true,
            intra_threads: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("temp"),
            output_suffix: "_enhanced".to_string(),
            keep_outputs: false,
            sweep_on_startup: true,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 20 * 1024 * 1024, // 20MB
            reject_unsupported_with_client_error: false,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Wildcard],
            allow_credentials: false,
            max_age: Some(3600), // Cache preflight for 1 hour
        }
    }
}

impl Default for EnhanceLimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            max_waiting: 20,
            max_wait: Duration::from_secs(60),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.model.path.as_os_str().is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: model.path cannot be empty".to_string(),
            });
        }

        if self.model.scale_factor == 0 {
            return Err(Error::Internal {
                operation: "Config validation: model.scale_factor must be at least 1".to_string(),
            });
        }

        if self.model.intra_threads == Some(0) {
            return Err(Error::Internal {
                operation: "Config validation: model.intra_threads must be at least 1 when set".to_string(),
            });
        }

        let suffix = &self.storage.output_suffix;
        if suffix.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: storage.output_suffix cannot be empty, outputs would overwrite their inputs".to_string(),
            });
        }
        if suffix.contains('/') || suffix.contains('\\') {
            return Err(Error::Internal {
                operation: format!("Config validation: storage.output_suffix '{suffix}' cannot contain path separators"),
            });
        }

        if self.cors.allowed_origins.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: CORS allowed_origins cannot be empty. Add at least one allowed origin.".to_string(),
            });
        }

        let has_wildcard = self.cors.allowed_origins.iter().any(|origin| matches!(origin, CorsOrigin::Wildcard));
        if has_wildcard && self.cors.allow_credentials {
            return Err(Error::Internal {
                operation: "Config validation: CORS cannot use wildcard origin '*' with allow_credentials=true. Specify explicit origins."
                    .to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // ENHANCE_CONFIG names the config file itself (see `Args`) and is not a config key
            .merge(Env::prefixed("ENHANCE_").ignore(&["config"]).split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
