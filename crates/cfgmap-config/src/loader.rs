//! Layered configuration loading.
//!
//! A store's configuration is assembled from up to two TOML files and the
//! caller's overrides, each layer winning over the one before it:
//!
//! 1. `~/.cfgmap/config.toml`
//! 2. `<root>/.cfgmap/config.toml`, next to the deployment
//! 3. [`ConfigOverrides`]
//!
//! Files are combined as TOML tables before deserialization, so a file
//! only changes the keys it spells out. A missing file is skipped.

use crate::error::ConfigError;
use crate::{ConfigOverrides, StoreConfig};
use std::path::{Path, PathBuf};
use toml::{Table, Value};
use tracing::{debug, trace};

const CONFIG_DIR: &str = ".cfgmap";
const CONFIG_FILE: &str = "config.toml";

/// Locates and combines the configuration files of a deployment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Holds the user-wide file; `None` when there is no home directory
    global_dir: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader whose user-wide layer lives under the home directory.
    pub fn new() -> Self {
        Self {
            global_dir: dirs::home_dir().map(|home| home.join(CONFIG_DIR)),
        }
    }

    pub fn with_global_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            global_dir: Some(dir.into()),
        }
    }

    /// Candidate files for `root`, lowest precedence first.
    pub fn sources(&self, root: &Path) -> Vec<PathBuf> {
        self.global_dir
            .iter()
            .map(|dir| dir.join(CONFIG_FILE))
            .chain(std::iter::once(root.join(CONFIG_DIR).join(CONFIG_FILE)))
            .collect()
    }

    /// Combine the files found for `root`, apply `overrides` and validate.
    pub fn load(
        &self,
        root: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<StoreConfig, ConfigError> {
        let mut layered = Table::new();
        for path in self.sources(root) {
            if !path.is_file() {
                trace!(path = %path.display(), "No config file");
                continue;
            }
            debug!(path = %path.display(), "Reading config file");
            overlay(&mut layered, read_layer(&path)?);
        }

        let mut config: StoreConfig = Value::Table(layered)
            .try_into()
            .map_err(ConfigError::Layered)?;
        if let Some(overrides) = overrides {
            config.apply_overrides(overrides);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Parse one file, rejecting it on its own so errors carry its path.
fn read_layer(path: &Path) -> Result<Table, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
    toml::from_str::<StoreConfig>(&text).map_err(|e| ConfigError::parse_toml(path, e))?;
    toml::from_str(&text).map_err(|e| ConfigError::parse_toml(path, e))
}

/// Write `upper` over `lower`, merging nested tables key by key.
fn overlay(lower: &mut Table, upper: Table) {
    for (key, value) in upper {
        match (lower.get_mut(&key), value) {
            (Some(Value::Table(below)), Value::Table(above)) => overlay(below, above),
            (_, value) => {
                lower.insert(key, value);
            }
        }
    }
}
