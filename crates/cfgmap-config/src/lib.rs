//! cfgmap Configuration Management
//!
//! Provides configuration loading with support for:
//! - Global config: `~/.cfgmap/config.toml`
//! - Local config: `.cfgmap/config.toml` (next to the deployment)
//! - Programmatic overrides via `ConfigOverrides`
//!
//! Configuration is merged in order: global → local → overrides.

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upper bound on the number of table partitions.
pub const MAX_PARTITIONS: usize = 64;

/// Default number of table partitions.
pub const DEFAULT_PARTITIONS: usize = 4;

/// Default number of entries visited per table-walk batch.
pub const DEFAULT_WALK_BATCH_SIZE: usize = 1024;

/// Default number of entries examined per generation-sweep batch.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 512;

/// Root configuration for the store.
///
/// Represents the fully merged configuration from all sources.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Table and partition settings
    pub store: StoreSettings,

    /// Generation sweep settings
    pub sweep: SweepConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Table storage settings.
///
/// # Example TOML
///
/// ```toml
/// [store]
/// partitions = 8
/// walk_batch_size = 2048
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreSettings {
    /// Number of partitions every table is sharded into (fixed for the process)
    pub partitions: usize,

    /// Entries visited per batch by table walkers
    pub walk_batch_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
            walk_batch_size: DEFAULT_WALK_BATCH_SIZE,
        }
    }
}

/// Stale-object sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SweepConfig {
    /// Entries examined per sweep batch before yielding
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: LogFormat,

    /// Log file path (optional)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON structured logging
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown log format '{}'. Valid values: text, json", s),
            )),
        }
    }
}

/// Overrides for configuration values.
///
/// Used to apply caller-supplied settings over file-based config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override partition count
    pub partitions: Option<usize>,

    /// Override table walk batch size
    pub walk_batch_size: Option<usize>,

    /// Override sweep batch size
    pub sweep_batch_size: Option<usize>,

    /// Override log level
    pub log_level: Option<String>,

    /// Override log format
    pub log_format: Option<LogFormat>,
}

impl StoreConfig {
    /// Apply overrides to this configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(partitions) = overrides.partitions {
            self.store.partitions = partitions;
        }

        if let Some(batch) = overrides.walk_batch_size {
            self.store.walk_batch_size = batch;
        }

        if let Some(batch) = overrides.sweep_batch_size {
            self.sweep.batch_size = batch;
        }

        if let Some(ref level) = overrides.log_level {
            self.logging.level = level.clone();
        }

        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.partitions == 0 || self.store.partitions > MAX_PARTITIONS {
            return Err(ConfigError::invalid_value(
                "store.partitions",
                format!(
                    "{} is out of range, expected 1..={}",
                    self.store.partitions, MAX_PARTITIONS
                ),
            ));
        }
        if self.store.walk_batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "store.walk_batch_size",
                "must be greater than zero",
            ));
        }
        if self.sweep.batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "sweep.batch_size",
                "must be greater than zero",
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "logging.level",
                "must not be empty",
            ));
        }
        Ok(())
    }
}
