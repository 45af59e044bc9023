//! Tunnel Configuration
//!
//! Configuration file schema for the tunnel client and its conversion into
//! a validated [`Session`]. Files are TOML or JSON, chosen by extension.
//!
//! ```toml
//! key = "base64 encoded 32 byte key"
//!
//! [server]
//! host = "vpn.example.net"
//! port = 51821
//!
//! [interface]
//! address = "10.9.0.100"
//! prefix_len = 24
//! ```

use crate::keys::{KeyError, SessionKey};
use crate::session::{ReconnectPolicy, Session, SessionOptions};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Default server port of the PhazeVPN protocol
pub const DEFAULT_PORT: u16 = 51821;

/// Default virtual interface name
pub const DEFAULT_INTERFACE_NAME: &str = "phazevpn0";

/// Default MTU for the virtual interface
pub const DEFAULT_MTU: u16 = 1420;

/// Remote tunnel endpoint (host + port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP literal
    pub host: String,
    /// UDP port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Virtual interface section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSection {
    /// Requested device name
    #[serde(default = "default_interface_name")]
    pub name: String,
    /// Assigned virtual IPv4 address
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,
    /// Prefix length of the virtual network
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    /// Interface MTU (also the maximum frame payload)
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Route all traffic through the tunnel
    #[serde(default = "default_true")]
    pub default_route: bool,
}

fn default_interface_name() -> String {
    DEFAULT_INTERFACE_NAME.to_string()
}

fn default_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 9, 0, 100)
}

fn default_prefix_len() -> u8 {
    24
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_true() -> bool {
    true
}

impl Default for InterfaceSection {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            address: default_address(),
            prefix_len: default_prefix_len(),
            mtu: default_mtu(),
            default_route: true,
        }
    }
}

/// Reconnect backoff section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: u32,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Give up after this many attempts (absent = retry until disconnect)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_factor() -> u32 {
    2
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
        }
    }
}

impl From<&ReconnectSection> for ReconnectPolicy {
    fn from(section: &ReconnectSection) -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_millis(section.base_delay_ms),
            factor: section.factor,
            max_delay: Duration::from_millis(section.max_delay_ms),
            max_attempts: section.max_attempts,
        }
    }
}

/// Timeout section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,
    #[serde(default = "default_io_ms")]
    pub io_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
}

fn default_handshake_ms() -> u64 {
    5_000
}

fn default_io_ms() -> u64 {
    1_000
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_idle_secs() -> u64 {
    120
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            handshake_ms: default_handshake_ms(),
            io_ms: default_io_ms(),
            keepalive_secs: default_keepalive_secs(),
            idle_secs: default_idle_secs(),
        }
    }
}

/// Complete tunnel client configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Session key material (base64, 32 bytes)
    pub key: String,
    /// Replay window size in frames
    #[serde(default = "default_replay_window")]
    pub replay_window: usize,
    /// Remote endpoint
    pub server: Endpoint,
    #[serde(default)]
    pub interface: InterfaceSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
}

fn default_replay_window() -> usize {
    64
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl TunnelConfig {
    /// Create a configuration with defaults for everything but the
    /// server and key
    pub fn new(server: Endpoint, key: &SessionKey) -> Self {
        Self {
            key: key.to_base64(),
            server,
            interface: InterfaceSection::default(),
            reconnect: ReconnectSection::default(),
            timeouts: TimeoutSection::default(),
            replay_window: default_replay_window(),
        }
    }

    /// Load from a file, format chosen by extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("json") => ConfigFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_str_format(&content, format)
    }

    /// Parse from a string in the given format
    pub fn from_str_format(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        match format {
            ConfigFormat::Toml => Self::from_toml(content),
            ConfigFormat::Json => Self::from_json(content),
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Session options described by this file
    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            interface_name: self.interface.name.clone(),
            default_route: self.interface.default_route,
            reconnect: ReconnectPolicy::from(&self.reconnect),
            handshake_timeout: Duration::from_millis(self.timeouts.handshake_ms),
            io_timeout: Duration::from_millis(self.timeouts.io_ms),
            keepalive_interval: Duration::from_secs(self.timeouts.keepalive_secs),
            idle_timeout: Duration::from_secs(self.timeouts.idle_secs),
            replay_window: self.replay_window,
        }
    }

    /// Build a validated session from this configuration
    pub fn into_session(self) -> Result<Session, ConfigError> {
        let key = SessionKey::from_base64(&self.key)?;
        let options = self.options();

        let session = Session::new(self.server, key)
            .with_address(self.interface.address, self.interface.prefix_len)
            .with_mtu(self.interface.mtu)
            .with_options(options);

        session.validate()?;
        Ok(session)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format (expected .toml or .json)")]
    UnsupportedFormat,

    #[error("Invalid key: {0}")]
    Key(#[from] KeyError),

    #[error("Missing server host")]
    MissingHost,

    #[error("Invalid server port")]
    InvalidPort,

    #[error("Invalid prefix length /{0} (maximum /32)")]
    InvalidPrefix(u8),

    #[error("MTU {0} out of range ({1}..={2})")]
    InvalidMtu(u16, u16, u16),

    #[error("Invalid option: {0}")]
    InvalidOption(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> String {
        SessionKey::from_bytes([9u8; 32]).to_base64()
    }

    fn sample_config() -> TunnelConfig {
        TunnelConfig::new(
            Endpoint::new("vpn.example.net", 51821),
            &SessionKey::generate(),
        )
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(
            Endpoint::new("vpn.example.net", 51821).to_string(),
            "vpn.example.net:51821"
        );
        assert_eq!(Endpoint::new("::1", 7).to_string(), "[::1]:7");
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let content = format!(
            "key = \"{}\"\n\n[server]\nhost = \"203.0.113.7\"\n",
            sample_key()
        );
        let config = TunnelConfig::from_toml(&content).unwrap();

        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.interface.name, DEFAULT_INTERFACE_NAME);
        assert_eq!(config.interface.address, Ipv4Addr::new(10, 9, 0, 100));
        assert_eq!(config.interface.mtu, DEFAULT_MTU);
        assert!(config.interface.default_route);
        assert_eq!(config.replay_window, 64);
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn test_json_config() {
        let content = format!(
            r#"{{
                "key": "{}",
                "server": {{ "host": "vpn.example.net", "port": 4000 }},
                "interface": {{ "mtu": 1280, "default_route": false }},
                "reconnect": {{ "base_delay_ms": 250, "max_attempts": 5 }}
            }}"#,
            sample_key()
        );
        let config = TunnelConfig::from_json(&content).unwrap();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.interface.mtu, 1280);
        assert!(!config.interface.default_route);

        let options = config.options();
        assert_eq!(options.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(options.reconnect.factor, 2);
        assert_eq!(options.reconnect.max_attempts, Some(5));
    }

    #[test]
    fn test_into_session() {
        let config = sample_config();
        let session = config.into_session().unwrap();

        assert_eq!(session.endpoint().host, "vpn.example.net");
        assert_eq!(session.mtu(), DEFAULT_MTU);
        assert_eq!(session.prefix_len(), 24);
    }

    #[test]
    fn test_invalid_key_rejected() {
        let mut config = sample_config();
        config.key = "c2hvcnQ=".to_string();

        assert_eq!(
            config.into_session().unwrap_err(),
            ConfigError::Key(KeyError::InvalidLength)
        );
    }

    #[test]
    fn test_invalid_mtu_rejected() {
        let mut config = sample_config();
        config.interface.mtu = 100;

        assert!(matches!(config.into_session(), Err(ConfigError::InvalidMtu(100, _, _))));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut keepalive = sample_config();
        keepalive.timeouts.keepalive_secs = 0;
        assert!(matches!(keepalive.into_session(), Err(ConfigError::InvalidOption(_))));

        let mut idle = sample_config();
        idle.timeouts.idle_secs = 0;
        assert!(matches!(idle.into_session(), Err(ConfigError::InvalidOption(_))));

        let mut handshake = sample_config();
        handshake.timeouts.handshake_ms = 0;
        assert!(matches!(handshake.into_session(), Err(ConfigError::InvalidOption(_))));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = sample_config();
        let text = config.to_toml().unwrap();

        assert_eq!(TunnelConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_unsupported_extension() {
        let result = TunnelConfig::from_file(Path::new("/tmp/phaze.ini"));
        assert_eq!(result.unwrap_err(), ConfigError::UnsupportedFormat);
    }
}
