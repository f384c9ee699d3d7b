//! Process configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use fleetd_depsync::SyncConfig;

/// Settings read from `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// SQLite database file.
    pub database: PathBuf,
    /// Enrollment sync engine settings.
    pub sync: SyncConfig,
    /// Per-topic event bus buffer.
    pub bus_capacity: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            database: data_dir().join("fleetd.db"),
            sync: SyncConfig::default(),
            bus_capacity: 1024,
        }
    }
}

impl FleetConfig {
    /// Load the configuration.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// used if present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = default_config_path();
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleetd")
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleetd")
        .join("config.json")
}
