//! Unified configuration for the router.
//!
//! Supports defaults embedded in the binary, TOML configuration files, and
//! environment variable overrides with the `MESH__` prefix:
//!
//! - `MESH__REQUEST__TIMEOUT_MS=2000`
//! - `MESH__REQUEST__BATCH_SIZE=500`
//! - `MESH__LOGGING__LEVEL=debug`

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root configuration for the router.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    /// Request defaults.
    pub request: RequestConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Per-request defaults, overridable per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Default per-call deadline in milliseconds.
    pub timeout_ms: u64,
    /// Default maximum tuples per partition per scan round.
    pub batch_size: u32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            batch_size: 100,
        }
    }
}

/// Logging defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when `MESH_LOG` is not set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RouterConfig {
    /// Loads configuration from an optional file path with environment
    /// variable overrides.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`MESH__*`)
    /// 2. Configuration file (if provided)
    /// 3. Built-in defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(file_path) = path {
            if Path::new(file_path).exists() {
                let contents = std::fs::read_to_string(file_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MESH__REQUEST__TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.request.timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("MESH__REQUEST__BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.request.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("MESH__LOGGING__LEVEL") {
            self.logging.level = val;
        }
    }

    /// The default per-call deadline as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request.timeout_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================
