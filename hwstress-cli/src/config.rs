// hwstress-cli/src/config.rs
// Configuration file loading

use anyhow::{Context, Result};
use hwstress_core::{RegistryConfig, WorkloadConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub workload: WorkloadConfig,
}

impl Config {
    /// Read `path`, falling back to defaults when the file is missing or malformed
    pub fn load(path: &Path) -> Self {
        match Self::read(path) {
            Ok(config) => {
                info!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) if !path.exists() => {
                warn!("Config file {} not found, using defaults", path.display());
                tracing::debug!("{:#}", e);
                Self::default()
            }
            Err(e) => {
                warn!("Failed to parse config file: {:#}; using defaults", e);
                Self::default()
            }
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
