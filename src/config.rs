// src/config.rs

//! Manages plugin configuration: loading from YAML, defaults, and validation.

use crate::core::BeskarError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a plugin process.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Address the plugin HTTP service binds to. Plaintext and TLS are
    /// multiplexed on this single port.
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Directory holding per-repository working state (SQLite files).
    #[serde(default = "default_datadir")]
    pub datadir: String,

    #[serde(default)]
    pub gossip: GossipConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Enables the Prometheus `/metrics` endpoint.
    #[serde(default)]
    pub profiling: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            datadir: default_datadir(),
            gossip: GossipConfig::default(),
            storage: StorageConfig::default(),
            log: LogConfig::default(),
            profiling: false,
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0:5100".to_string()
}

fn default_datadir() -> String {
    "/tmp/beskar".to_string()
}

/// Gossip fabric configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GossipConfig {
    /// Address the gossip fabric binds to (UDP for membership, TCP for the
    /// full-state push/pull).
    #[serde(default = "default_gossip_addr")]
    pub addr: String,

    /// Shared fleet key. Signs membership messages and encrypts the state
    /// exchange that carries the cluster CA.
    #[serde(default)]
    pub key: Option<String>,

    /// Seed peers to join at startup. Empty means this node bootstraps the
    /// fleet on its own.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Overall deadline for the first-contact state fetch at bootstrap.
    #[serde(with = "humantime_serde", default = "default_state_timeout")]
    pub state_timeout: Duration,

    /// Bound on graceful leave and readiness broadcasts.
    #[serde(with = "humantime_serde", default = "default_broadcast_timeout")]
    pub broadcast_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            addr: default_gossip_addr(),
            key: None,
            peers: vec![],
            state_timeout: default_state_timeout(),
            broadcast_timeout: default_broadcast_timeout(),
        }
    }
}

fn default_gossip_addr() -> String {
    "0.0.0.0:5102".to_string()
}

fn default_state_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_broadcast_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Object-storage driver selection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageDriver {
    #[default]
    Filesystem,
    Memory,
}

/// Object-storage configuration. Isolation between repositories is by key
/// prefix; the bucket itself is shared across plugin instances of one kind.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub driver: StorageDriver,

    /// Key prefix prepended to every repository key.
    #[serde(default)]
    pub prefix: String,

    #[serde(default)]
    pub filesystem: FilesystemStorageConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FilesystemStorageConfig {
    #[serde(default = "default_storage_directory")]
    pub directory: String,
}

impl Default for FilesystemStorageConfig {
    fn default() -> Self {
        Self {
            directory: default_storage_directory(),
        }
    }
}

fn default_storage_directory() -> String {
    "/tmp/beskar-storage".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Loads the configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .build()
            .with_context(|| format!("Failed to read configuration file '{path}'"))?;
        let cfg: Config = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse configuration file '{path}'"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a YAML document directly, mainly for tests.
    pub fn from_yaml(document: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(document, config::FileFormat::Yaml))
            .build()
            .context("Failed to read configuration document")?;
        let cfg: Config = settings
            .try_deserialize()
            .context("Failed to parse configuration document")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        self.service_port()
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(())
    }

    /// The service port parsed out of `addr`.
    pub fn service_port(&self) -> Result<u16, BeskarError> {
        let port = self
            .addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| {
                BeskarError::InvalidArgument(format!("invalid service address '{}'", self.addr))
            })?;
        Ok(port)
    }
}
