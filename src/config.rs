//! wolfstore Configuration
//!
//! This module provides configuration structures for wolfstore endpoints.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main wolfstore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfStoreConfig {
    /// Endpoint identity
    pub endpoint: EndpointConfig,

    /// Store replication timing
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name (used in logs)
    pub name: String,
}

/// Store replication timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long frontend and clone queries wait for the master, in milliseconds
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// How often clones resynchronize from a snapshot, in milliseconds
    #[serde(default = "default_resync_interval_ms")]
    pub resync_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_query_timeout_ms() -> u64 {
    5000
}

fn default_resync_interval_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            resync_interval_ms: default_resync_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfStoreConfig {
    /// Create a configuration with defaults for the named endpoint
    pub fn for_endpoint(name: impl Into<String>) -> Self {
        Self {
            endpoint: EndpointConfig { name: name.into() },
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfStoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.endpoint.name.is_empty() {
            return Err(crate::Error::Config("endpoint.name cannot be empty".into()));
        }

        if self.store.query_timeout_ms == 0 {
            return Err(crate::Error::Config("store.query_timeout_ms must be positive".into()));
        }

        if self.store.resync_interval_ms == 0 {
            return Err(crate::Error::Config("store.resync_interval_ms must be positive".into()));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or json, got {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Get query timeout as Duration
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.store.query_timeout_ms)
    }

    /// Get resync interval as Duration
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.store.resync_interval_ms)
    }
}
