//! Store error types.
//!
//! Only construction and registration surface errors. Request processing
//! handles every recoverable condition where it is detected (trace, defer
//! or drop) and never reports back to the request originator.

use cfgmap_config::ConfigError;
use thiserror::Error;

/// Errors returned by store construction and registration calls.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid partition count {count}: expected 1..={max}")]
    InvalidPartitionCount { count: usize, max: usize },

    #[error("Table already exists: {0}")]
    DuplicateTable(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Listener not registered: {0}")]
    ListenerNotFound(u64),

    #[error("Telemetry initialisation failed: {0}")]
    Telemetry(String),
}
