//! Logging bootstrap for processes embedding the store.

use crate::error::StoreError;
use cfgmap_config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

fn filter(config: &LoggingConfig) -> Result<EnvFilter, StoreError> {
    EnvFilter::try_new(&config.level)
        .map_err(|e| StoreError::Telemetry(format!("invalid filter '{}': {}", config.level, e)))
}

fn writer(config: &LoggingConfig) -> Result<BoxMakeWriter, StoreError> {
    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| StoreError::Telemetry(format!("{}: {}", path.display(), e)))?;
            Ok(BoxMakeWriter::new(std::sync::Mutex::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stderr)),
    }
}

/// Install the global tracing subscriber described by `config`.
///
/// Fails if the filter does not parse, the log file cannot be opened, or a
/// global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), StoreError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(config)?)
        .with_writer(writer(config)?)
        .with_target(false);

    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| StoreError::Telemetry(e.to_string()))?;

    info!(level = %config.level, format = %config.format, "Logging initialised");
    Ok(())
}
