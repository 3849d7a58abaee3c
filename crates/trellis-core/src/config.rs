//! Configuration system for Trellis.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TRELLIS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/trellis/config.toml
//!   3. ~/.config/trellis/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::endpoint::{Endpoint, EndpointError};
use crate::facts::FactSet;
use crate::wire::{DEFAULT_BROADCAST_INTERVAL_SECS, DEFAULT_BROADCAST_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    pub network: NetworkConfig,
    /// Services hosted by this node, announced once trackers appear.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Mailbox endpoint. `*` binds every interface; port 0 probes the
    /// ephemeral range.
    pub mailbox: String,
    /// UDP port beacons are sent to and received on.
    pub broadcast_port: u16,
    pub broadcast_interval_secs: u64,
    /// If false the node only listens for beacons and never sends any.
    pub active_broadcast: bool,
    /// Upper bound for each component's shutdown.
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub facts: FactSet,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mailbox: "tcp://*:0".to_string(),
            broadcast_port: DEFAULT_BROADCAST_PORT,
            broadcast_interval_secs: DEFAULT_BROADCAST_INTERVAL_SECS,
            active_broadcast: true,
            shutdown_timeout_secs: 5,
        }
    }
}

impl NetworkConfig {
    pub fn mailbox_endpoint(&self) -> Result<Endpoint, EndpointError> {
        self.mailbox.parse()
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("trellis")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TrellisConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when it does not exist.
    /// No env overrides are applied.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(TrellisConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TRELLIS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&TrellisConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply TRELLIS_* overrides. `lookup` resolves a variable name; unparseable
    /// values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TRELLIS_NETWORK__MAILBOX") {
            self.network.mailbox = v;
        }
        if let Some(v) = lookup("TRELLIS_NETWORK__BROADCAST_PORT") {
            if let Ok(p) = v.parse() {
                self.network.broadcast_port = p;
            }
        }
        if let Some(v) = lookup("TRELLIS_NETWORK__BROADCAST_INTERVAL_SECS") {
            if let Ok(s) = v.parse() {
                self.network.broadcast_interval_secs = s;
            }
        }
        if let Some(v) = lookup("TRELLIS_NETWORK__ACTIVE_BROADCAST") {
            self.network.active_broadcast = v == "true" || v == "1";
        }
    }
}
