//! Configuration for the management daemon
//!
//! Loaded from a TOML file, then overridden by `BEEGFS_*` environment
//! variables and command line arguments.

use beegfs_core::DEFAULT_MGMT_PORT;
use beegfs_topology::{TargetStateConfig, MIN_OFFLINE_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

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

/// Complete management daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MgmtConfig {
    /// Identity and listen address
    #[serde(default)]
    pub mgmt: MgmtSettings,

    /// Cluster-wide policies
    #[serde(default)]
    pub sys: SysSettings,

    /// Target state monitor
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Prometheus exporter
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl MgmtConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: MgmtConfig = toml::from_str(&content)?;
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

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sys.target_offline_timeout() < MIN_OFFLINE_TIMEOUT {
            return Err(ConfigError::ValidationError(format!(
                "sys.target_offline_timeout_secs must be at least {}, got {}",
                MIN_OFFLINE_TIMEOUT.as_secs(),
                self.sys.target_offline_timeout_secs
            )));
        }

        if self.mgmt.port == 0 {
            return Err(ConfigError::ValidationError(
                "mgmt port cannot be 0".to_string(),
            ));
        }

        if self.mgmt.string_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "mgmt string_id cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, port: Option<u16>, allow_new_servers: Option<bool>) -> Self {
        if let Some(p) = port {
            self.mgmt.port = p;
        }
        if let Some(allow) = allow_new_servers {
            self.sys.allow_new_servers = allow;
        }
        self
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(port) = env_parse("BEEGFS_MGMT_PORT") {
            self.mgmt.port = port;
        }

        if let Ok(id) = std::env::var("BEEGFS_MGMT_STRING_ID") {
            self.mgmt.string_id = id;
        }

        if let Some(secs) = env_parse("BEEGFS_TARGET_OFFLINE_TIMEOUT_SECS") {
            self.sys.target_offline_timeout_secs = secs;
        }

        if let Some(allow) = env_parse("BEEGFS_ALLOW_NEW_SERVERS") {
            self.sys.allow_new_servers = allow;
        }

        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MgmtSettings {
    /// Address to bind the message server to
    #[serde(default = "default_bind_addr")]
    pub bind_address: String,

    #[serde(default = "default_mgmt_port")]
    pub port: u16,

    /// String ID the daemon registers itself under
    #[serde(default = "default_string_id")]
    pub string_id: String,

    /// Numeric ID of the daemon
    #[serde(default = "default_num_id")]
    pub num_id: u32,
}

impl Default for MgmtSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_addr(),
            port: default_mgmt_port(),
            string_id: default_string_id(),
            num_id: default_num_id(),
        }
    }
}

impl MgmtSettings {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| ConfigError::ValidationError(format!("bad listen address: {}", e)))
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_mgmt_port() -> u16 {
    DEFAULT_MGMT_PORT
}

fn default_string_id() -> String {
    "mgmtd".to_string()
}

fn default_num_id() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysSettings {
    /// Seconds without reports before a target is considered offline
    #[serde(default = "default_offline_timeout")]
    pub target_offline_timeout_secs: u64,

    /// Accept meta and storage servers whose string ID is not yet known
    #[serde(default = "default_true")]
    pub allow_new_servers: bool,
}

impl Default for SysSettings {
    fn default() -> Self {
        Self {
            target_offline_timeout_secs: default_offline_timeout(),
            allow_new_servers: true,
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

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Check interval; defaults to a sixth of the offline timeout
    #[serde(default)]
    pub interval_secs: Option<u64>,
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
    9108
}
