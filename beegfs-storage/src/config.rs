//! Configuration for the storage daemon
//!
//! Loaded from a TOML file, then overridden by `BEEGFS_*` environment
//! variables and command line arguments.

use beegfs_core::{TargetId, DEFAULT_MGMT_PORT, DEFAULT_STORAGE_PORT};
use beegfs_topology::{TargetStateConfig, MIN_OFFLINE_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::internode_syncer::{SyncerConfig, TopologyChangePolicy};
use crate::resync::ResyncConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete storage daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Identity and listen address of this daemon
    #[serde(default)]
    pub node: NodeSettings,

    /// Where to reach the management daemon
    #[serde(default)]
    pub mgmt: MgmtSettings,

    #[serde(default)]
    pub sys: SysSettings,

    /// Topology sync with the management daemon
    #[serde(default)]
    pub sync: SyncSettings,

    /// Buddy mirror resync
    #[serde(default)]
    pub resync: ResyncSettings,

    /// Local storage targets
    #[serde(default)]
    pub targets: Vec<TargetSettings>,

    /// Prometheus exporter
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl StorageConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: StorageConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration. Missing target directories are created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sys.target_offline_timeout() < MIN_OFFLINE_TIMEOUT {
            return Err(ConfigError::ValidationError(format!(
                "sys.target_offline_timeout_secs must be at least {}, got {}",
                MIN_OFFLINE_TIMEOUT.as_secs(),
                self.sys.target_offline_timeout_secs
            )));
        }

        if self.node.string_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "node string_id cannot be empty".to_string(),
            ));
        }

        if self.node.port == 0 || self.mgmt.port == 0 {
            return Err(ConfigError::ValidationError(
                "ports cannot be 0".to_string(),
            ));
        }

        if self.sync.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sync.interval_secs cannot be 0".to_string(),
            ));
        }

        if self.sync.max_consecutive_failures == 0 {
            return Err(ConfigError::ValidationError(
                "sync.max_consecutive_failures cannot be 0".to_string(),
            ));
        }

        for (name, count) in [
            ("resync.dir_sync_slaves", self.resync.dir_sync_slaves),
            ("resync.file_sync_slaves", self.resync.file_sync_slaves),
            ("resync.gather_slaves", self.resync.gather_slaves),
        ] {
            if count == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for target in &self.targets {
            if target.id == 0 {
                return Err(ConfigError::ValidationError(
                    "target id 0 is reserved".to_string(),
                ));
            }
            if !seen.insert(target.id) {
                return Err(ConfigError::ValidationError(format!(
                    "target {} configured twice",
                    target.id
                )));
            }
            if !target.path.exists() {
                std::fs::create_dir_all(&target.path).map_err(|e| {
                    ConfigError::ValidationError(format!(
                        "Cannot create target directory {:?}: {}",
                        target.path, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, port: Option<u16>, mgmt_host: Option<String>) -> Self {
        if let Some(p) = port {
            self.node.port = p;
        }
        if let Some(host) = mgmt_host {
            self.mgmt.host = host;
        }
        self
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(id) = std::env::var("BEEGFS_NODE_STRING_ID") {
            self.node.string_id = id;
        }

        if let Some(port) = env_parse("BEEGFS_STORAGE_PORT") {
            self.node.port = port;
        }

        if let Ok(host) = std::env::var("BEEGFS_MGMT_HOST") {
            self.mgmt.host = host;
        }

        if let Some(port) = env_parse("BEEGFS_MGMT_PORT") {
            self.mgmt.port = port;
        }

        if let Some(secs) = env_parse("BEEGFS_TARGET_OFFLINE_TIMEOUT_SECS") {
            self.sys.target_offline_timeout_secs = secs;
        }

        if let Some(secs) = env_parse("BEEGFS_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = secs;
        }

        self
    }

    pub fn syncer_config(&self) -> SyncerConfig {
        SyncerConfig {
            interval: Duration::from_secs(self.sync.interval_secs),
            check_network_interval: Duration::from_secs(self.sync.check_network_interval_secs),
            max_consecutive_failures: self.sync.max_consecutive_failures,
            topology_change_policy: self.sync.topology_change_policy,
        }
    }

    pub fn resync_config(&self) -> ResyncConfig {
        ResyncConfig {
            dir_sync_slaves: self.resync.dir_sync_slaves,
            file_sync_slaves: self.resync.file_sync_slaves,
            gather_slaves: self.resync.gather_slaves,
            safety_threshold: Duration::from_secs(self.resync.safety_threshold_mins * 60),
            ..ResyncConfig::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// String ID to register under
    #[serde(default = "default_string_id")]
    pub string_id: String,

    /// Numeric ID; 0 lets the management daemon assign one
    #[serde(default)]
    pub num_id: u32,

    #[serde(default = "default_bind_addr")]
    pub bind_address: String,

    #[serde(default = "default_storage_port")]
    pub port: u16,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            string_id: default_string_id(),
            num_id: 0,
            bind_address: default_bind_addr(),
            port: default_storage_port(),
        }
    }
}

impl NodeSettings {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| ConfigError::ValidationError(format!("bad listen address: {}", e)))
    }
}

fn default_string_id() -> String {
    "storage01".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_storage_port() -> u16 {
    DEFAULT_STORAGE_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MgmtSettings {
    #[serde(default = "default_mgmt_host")]
    pub host: String,

    #[serde(default = "default_mgmt_port")]
    pub port: u16,
}

impl Default for MgmtSettings {
    fn default() -> Self {
        Self {
            host: default_mgmt_host(),
            port: default_mgmt_port(),
        }
    }
}

impl MgmtSettings {
    /// Resolve the management daemon address
    pub fn resolve(&self) -> Result<SocketAddr, ConfigError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                ConfigError::ValidationError(format!("cannot resolve {}: {}", self.host, e))
            })?
            .next()
            .ok_or_else(|| {
                ConfigError::ValidationError(format!("mgmt host {} has no address", self.host))
            })
    }
}

fn default_mgmt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mgmt_port() -> u16 {
    DEFAULT_MGMT_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysSettings {
    /// Seconds without reports before a target is considered offline
    #[serde(default = "default_offline_timeout")]
    pub target_offline_timeout_secs: u64,
}

impl Default for SysSettings {
    fn default() -> Self {
        Self {
            target_offline_timeout_secs: default_offline_timeout(),
        }
    }
}

impl SysSettings {
    pub fn target_offline_timeout(&self) -> Duration {
        Duration::from_secs(self.target_offline_timeout_secs)
    }

    pub fn target_state_config(&self) -> TargetStateConfig {
        TargetStateConfig::from_secs(self.target_offline_timeout_secs)
    }
}

fn default_offline_timeout() -> u64 {
    180
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_check_network_interval")]
    pub check_network_interval_secs: u64,

    /// Failed cycles in a row before the daemon gives up
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default)]
    pub topology_change_policy: TopologyChangePolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            check_network_interval_secs: default_check_network_interval(),
            max_consecutive_failures: default_max_failures(),
            topology_change_policy: TopologyChangePolicy::default(),
        }
    }
}

fn default_sync_interval() -> u64 {
    30
}

fn default_check_network_interval() -> u64 {
    60
}

fn default_max_failures() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncSettings {
    #[serde(default = "default_dir_sync_slaves")]
    pub dir_sync_slaves: usize,

    #[serde(default = "default_file_sync_slaves")]
    pub file_sync_slaves: usize,

    #[serde(default = "default_gather_slaves")]
    pub gather_slaves: usize,

    /// Subtracted from the last buddy communication time; 0 disables it
    #[serde(default = "default_safety_threshold")]
    pub safety_threshold_mins: u64,

    /// How often to look for secondaries that need a resync
    #[serde(default = "default_resync_check_interval")]
    pub check_interval_secs: u64,
}

impl Default for ResyncSettings {
    fn default() -> Self {
        Self {
            dir_sync_slaves: default_dir_sync_slaves(),
            file_sync_slaves: default_file_sync_slaves(),
            gather_slaves: default_gather_slaves(),
            safety_threshold_mins: default_safety_threshold(),
            check_interval_secs: default_resync_check_interval(),
        }
    }
}

fn default_dir_sync_slaves() -> usize {
    4
}

fn default_file_sync_slaves() -> usize {
    4
}

fn default_gather_slaves() -> usize {
    2
}

fn default_safety_threshold() -> u64 {
    10
}

fn default_resync_check_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSettings {
    pub id: TargetId,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9109
}
