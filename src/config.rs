//! eipip Configuration
//!
//! This module provides the TOML configuration file layout and its
//! resolution into the immutable [`PeerConfig`] and key used by the tunnel.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::{CipherSuite, KeyMaterial};
use crate::error::{Error, Result};
use crate::header::{MAX_DATAGRAM_LEN, OUTER_HEADER_LEN};

/// Default private protocol number carried in the outer header
pub const DEFAULT_PROTOCOL: u8 = 253;

/// Default outer TTL
pub const DEFAULT_TTL: u8 = 255;

/// Smallest outer MTU every IPv4 link must carry
pub const MIN_OUTER_MTU: usize = 68;

/// Main eipip configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel endpoint configuration
    pub tunnel: TunnelConfig,

    /// Cipher and key
    #[serde(default)]
    pub security: SecurityConfig,

    /// Event loop tuning
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tunnel endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// TUN interface name
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Our address on the underlay, used as outer source
    pub local_address: Ipv4Addr,

    /// Peer address on the underlay, used as outer destination
    pub remote_address: Ipv4Addr,

    /// IP protocol number of encapsulated traffic
    #[serde(default = "default_protocol")]
    pub protocol: u8,

    /// Outer TTL
    #[serde(default = "default_ttl")]
    pub ttl: u8,

    /// Outer type-of-service byte
    #[serde(default)]
    pub tos: u8,

    /// Set the don't-fragment bit on outer datagrams
    #[serde(default)]
    pub pmtu_discovery: bool,

    /// Ceiling for the whole outer datagram in bytes
    #[serde(default = "default_outer_mtu")]
    pub outer_mtu: usize,

    /// Address to assign to the TUN interface (left unconfigured if absent)
    #[serde(default)]
    pub address: Option<Ipv4Addr>,

    /// Prefix length for `address`
    #[serde(default = "default_prefix")]
    pub prefix: u8,
}

/// Cipher and key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Cipher suite
    #[serde(default)]
    pub cipher: CipherSuite,

    /// Hex-encoded key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// File holding the hex-encoded key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on a single readiness wait, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often counters are logged, in seconds (0 disables)
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// Where to write the JSON status report (optional)
    #[serde(default)]
    pub status_file: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Resolved, immutable tunnel parameters shared by header construction and
/// datagram filtering. The key travels separately as [`KeyMaterial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub local_address: Ipv4Addr,
    pub remote_address: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub tos: u8,
    pub pmtu_discovery: bool,
    pub outer_mtu: usize,
    pub cipher: CipherSuite,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            local_address: Ipv4Addr::UNSPECIFIED,
            remote_address: Ipv4Addr::UNSPECIFIED,
            protocol: DEFAULT_PROTOCOL,
            ttl: DEFAULT_TTL,
            tos: 0,
            pmtu_discovery: false,
            outer_mtu: default_outer_mtu(),
            cipher: CipherSuite::default(),
        }
    }
}

impl PeerConfig {
    /// Largest inner packet that still fits the outer MTU once encrypted
    pub fn mtu_budget(&self) -> usize {
        self.outer_mtu
            .saturating_sub(OUTER_HEADER_LEN)
            .saturating_sub(self.cipher.max_overhead())
    }

    /// Check the invariants the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if self.local_address.is_unspecified() {
            return Err(Error::Config("local address cannot be 0.0.0.0".into()));
        }
        if self.remote_address.is_unspecified() {
            return Err(Error::Config("remote address cannot be 0.0.0.0".into()));
        }
        if self.ttl == 0 {
            return Err(Error::Config("ttl must be at least 1".into()));
        }
        if !(MIN_OUTER_MTU..=MAX_DATAGRAM_LEN).contains(&self.outer_mtu) {
            return Err(Error::Config(format!(
                "outer_mtu {} outside [{}, {}]",
                self.outer_mtu, MIN_OUTER_MTU, MAX_DATAGRAM_LEN
            )));
        }
        if self.mtu_budget() == 0 {
            return Err(Error::Config(format!(
                "outer_mtu {} leaves no room for {} payload",
                self.outer_mtu, self.cipher
            )));
        }
        Ok(())
    }
}

// Default value functions
fn default_interface() -> String {
    "turtle".to_string()
}

fn default_protocol() -> u8 {
    DEFAULT_PROTOCOL
}

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

fn default_outer_mtu() -> usize {
    1500
}

fn default_prefix() -> u8 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stats_interval_secs: default_stats_interval_secs(),
            status_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DispatcherConfig {
    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get stats interval as Duration, `None` when disabled
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

impl Config {
    /// A config template using documentation addresses and the given key
    pub fn template(key: &KeyMaterial, cipher: CipherSuite) -> Self {
        Self {
            tunnel: TunnelConfig {
                interface: default_interface(),
                local_address: Ipv4Addr::new(192, 0, 2, 1),
                remote_address: Ipv4Addr::new(198, 51, 100, 1),
                protocol: DEFAULT_PROTOCOL,
                ttl: DEFAULT_TTL,
                tos: 0,
                pmtu_discovery: false,
                outer_mtu: default_outer_mtu(),
                address: None,
                prefix: default_prefix(),
            },
            security: SecurityConfig {
                cipher,
                key: Some(key.to_hex()),
                key_file: None,
            },
            dispatcher: DispatcherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, readable by the owner only
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let iface = &self.tunnel.interface;
        if iface.is_empty() || iface.len() > 15 {
            return Err(Error::Config(format!(
                "tunnel.interface '{}' must be 1-15 bytes",
                iface
            )));
        }

        if self.tunnel.prefix > 32 {
            return Err(Error::Config("tunnel.prefix cannot exceed 32".into()));
        }

        self.peer_config().validate()?;

        match (&self.security.key, &self.security.key_file) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "set only one of security.key and security.key_file".into(),
                ))
            }
            (None, None) => {
                return Err(Error::Config(
                    "one of security.key or security.key_file is required".into(),
                ))
            }
            _ => {}
        }

        if self.dispatcher.poll_interval_ms == 0 {
            return Err(Error::Config("dispatcher.poll_interval_ms cannot be 0".into()));
        }

        Ok(())
    }

    /// Resolve the immutable tunnel parameters
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            local_address: self.tunnel.local_address,
            remote_address: self.tunnel.remote_address,
            protocol: self.tunnel.protocol,
            ttl: self.tunnel.ttl,
            tos: self.tunnel.tos,
            pmtu_discovery: self.tunnel.pmtu_discovery,
            outer_mtu: self.tunnel.outer_mtu,
            cipher: self.security.cipher,
        }
    }

    /// Load the key from the inline value or key file and check its length
    pub fn load_key(&self) -> Result<KeyMaterial> {
        let key = match (&self.security.key, &self.security.key_file) {
            (Some(hex), _) => KeyMaterial::from_hex(hex)?,
            (None, Some(path)) => {
                let content = zeroize::Zeroizing::new(std::fs::read_to_string(path)?);
                KeyMaterial::from_hex(&content)?
            }
            (None, None) => return Err(Error::Config("no key configured".into())),
        };
        self.security.cipher.check_key_len(key.len())?;
        Ok(key)
    }
}
