// src/config.rs

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where each request's engine keeps its downloaded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Growable in-memory buffer; resumable only through persisted snapshots.
    #[default]
    Memory,
    /// `<destination>.odm-part` file next to the destination.
    File,
}

/// Manager configuration, usually loaded from a `odm.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of simultaneously active transfers.
    pub max_concurrent_downloads: usize,
    /// Buffered events per subscriber before it starts lagging.
    pub event_capacity: usize,
    pub user_agent: String,
    /// Connect timeout for the HTTP engine, in seconds.
    pub request_timeout_secs: u64,
    pub storage: StorageKind,
    /// SQLite database for request records and snapshots. None = no persistence.
    pub state_db: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            event_capacity: 256,
            user_agent: concat!("odm/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout_secs: 30,
            storage: StorageKind::Memory,
            state_db: None,
        }
    }
}

impl ManagerConfig {
    /// Loads a config file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: ManagerConfig =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise returns the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            bail!("max_concurrent_downloads must be greater than zero");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
