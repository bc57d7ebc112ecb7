//! # Node Configuration
//!
//! TOML configuration shared by every onionnet process.
//!
//! ## Example Configuration
//! ```toml
//! [network]
//! host = "127.0.0.1"
//! registry_port = 8080
//! base_router_port = 4000
//! base_user_port = 3000
//!
//! [rpc]
//! timeout_ms = 5000
//! max_frame_size = 1048576
//!
//! [circuit]
//! default_length = 3
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every section is optional; a missing file means all defaults.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use onionnet_transport::{NetworkLayout, RpcConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest relay or user ID a layout has to make room for.
pub const MAX_NODE_ID: u16 = 999;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or parsed.
    #[error("Failed to load config from {path}: {reason}")]
    Load {
        /// Source of the configuration.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// A value is out of range.
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// The configuration could not be written back out.
    #[error("Failed to serialize config: {0}")]
    Serialize(String),
}

impl ConfigError {
    fn load(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Where a loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read from this file.
    File(String),
    /// No file at this path; built-in defaults.
    Defaults(String),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "loaded from {}", path),
            Self::Defaults(path) => write!(f, "defaults (no file at {})", path),
        }
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Where every process listens.
    #[serde(default)]
    pub network: NetworkLayout,

    /// RPC limits.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Circuit defaults.
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Log settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Circuit defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Relays per circuit when a send does not say.
    #[serde(default = "default_circuit_length")]
    pub default_length: usize,
}

fn default_circuit_length() -> usize {
    onionnet_transport::user::DEFAULT_CIRCUIT_LENGTH
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            default_length: default_circuit_length(),
        }
    }
}

/// Log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load and validate the file at `path`.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::load(&path_str, e))?;
        Self::parse(&content, &path_str)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    ///
    /// Nothing is logged here; callers report the returned source once
    /// their subscriber is installed.
    pub async fn load_or_default(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigSource), ConfigError> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let config = Self::load(path).await?;
            Ok((config, ConfigSource::File(path_str)))
        } else {
            Ok((Self::default(), ConfigSource::Defaults(path_str)))
        }
    }

    fn parse(content: &str, source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::load(source, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.timeout_ms == 0 {
            return Err(ConfigError::invalid("rpc.timeout_ms", "must be greater than 0"));
        }
        if self.rpc.max_frame_size == 0 {
            return Err(ConfigError::invalid(
                "rpc.max_frame_size",
                "must be greater than 0",
            ));
        }
        if self.circuit.default_length == 0 {
            return Err(ConfigError::invalid(
                "circuit.default_length",
                "a circuit needs at least one relay",
            ));
        }
        if self.network.host.is_empty() {
            return Err(ConfigError::invalid("network.host", "cannot be empty"));
        }
        validate_ports(&self.network)
    }

    /// Serialize back to TOML.
    ///
    /// # Errors
    /// Returns error if a value has no TOML representation.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}

impl FromStr for NodeConfig {
    type Err = ConfigError;

    /// Parse and validate TOML text.
    fn from_str(content: &str) -> Result<Self, Self::Err> {
        Self::parse(content, "<string>")
    }
}

/// Relay and user IDs must be in `1..=MAX_NODE_ID`; anything else would
/// listen outside its port range, possibly on another node's port.
pub fn check_node_id(field: &'static str, id: u32) -> Result<(), ConfigError> {
    if (1..=u32::from(MAX_NODE_ID)).contains(&id) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("{} is outside 1..={}", id, MAX_NODE_ID),
        ))
    }
}

/// Relay ports `base_router_port + 1 ..= base_router_port + MAX_NODE_ID`
/// and the user range built the same way must fit in `u16`, must not
/// overlap, and must not contain the registry port.
fn validate_ports(network: &NetworkLayout) -> Result<(), ConfigError> {
    let routers = port_range("network.base_router_port", network.base_router_port)?;
    let users = port_range("network.base_user_port", network.base_user_port)?;

    if routers.start() <= users.end() && users.start() <= routers.end() {
        return Err(ConfigError::invalid(
            "network",
            format!(
                "relay ports {:?} overlap user ports {:?}",
                routers, users
            ),
        ));
    }
    if routers.contains(&network.registry_port) || users.contains(&network.registry_port) {
        return Err(ConfigError::invalid(
            "network.registry_port",
            format!("{} collides with a relay or user port", network.registry_port),
        ));
    }
    Ok(())
}

fn port_range(
    field: &'static str,
    base: u16,
) -> Result<std::ops::RangeInclusive<u16>, ConfigError> {
    let last = base.checked_add(MAX_NODE_ID).ok_or_else(|| {
        ConfigError::invalid(field, format!("{} leaves no room for {} nodes", base, MAX_NODE_ID))
    })?;
    Ok(base + 1..=last)
}
