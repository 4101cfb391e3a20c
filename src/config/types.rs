//! Configuration types

use crate::mirror::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_QUEUE_DEPTH};
use crate::telemetry::LogConfig;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 1024;

/// User-defined configuration (config.toml)
///
/// Proxies are kept in name order so both sides of a pair set up their
/// mirror connections in the same sequence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub proxies: BTreeMap<String, ProxyConfig>,
}

/// Which side of the replication pair an instance runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
        }
    }
}

/// Traffic direction a proxy attaches to. Only `all` is supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterDirection {
    #[default]
    All,
    Rx,
    Tx,
}

/// One protected interface
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub role: Role,
    /// "host:port" to connect to (primary), ":port" or "host:port" to listen on (secondary)
    pub addr: Option<String>,
    #[serde(default)]
    pub direction: FilterDirection,
    /// Interface facing the guest
    pub guest_interface: Option<String>,
    /// Interface facing the network
    pub uplink_interface: Option<String>,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Frames waiting for the mirror writer before the link counts as stalled
    #[serde(default = "default_mirror_queue_depth")]
    pub mirror_queue_depth: usize,
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_queue_depth() -> usize {
    DEFAULT_MAX_QUEUE_DEPTH
}

fn default_mirror_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

impl ProxyConfig {
    pub fn new(role: Role, addr: impl Into<String>) -> Self {
        Self {
            role,
            addr: Some(addr.into()),
            direction: FilterDirection::All,
            guest_interface: None,
            uplink_interface: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            mirror_queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Address the mirror transport connects to (primary) or listens on
    /// (secondary).
    pub fn endpoint(&self) -> Result<String> {
        if self.direction != FilterDirection::All {
            return Err(Error::Config(format!(
                "direction {:?} is not supported, use \"all\"",
                self.direction
            )));
        }
        let addr = self
            .addr
            .as_deref()
            .ok_or_else(|| Error::Config("addr is required".into()))?;
        let peer = PeerAddr::parse(addr)?;
        match self.role {
            Role::Primary => peer.connect_addr(),
            Role::Secondary => Ok(peer.listen_addr()),
        }
    }
}

/// `[registry]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 65536,
            idle_timeout_secs: 300,
        }
    }
}

/// `[checkpoint]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// How often the daemon attempts a gated checkpoint
    pub interval_ms: u64,
    /// Deferred attempts in a row before the primary forces one
    pub max_deferrals: u32,
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_deferrals: 5,
        }
    }
}

/// Parsed `addr` value: optional host plus port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub host: Option<String>,
    pub port: u16,
}

impl PeerAddr {
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("addr '{}' has no port", addr)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("addr '{}' has an invalid port", addr)))?;
        if port == 0 {
            return Err(Error::Config(format!("addr '{}' has port 0", addr)));
        }
        let host = (!host.is_empty()).then(|| host.to_string());
        Ok(Self { host, port })
    }

    /// "host:port"; a host is required
    pub fn connect_addr(&self) -> Result<String> {
        match &self.host {
            Some(host) => Ok(format!("{}:{}", host, self.port)),
            None => Err(Error::Config(format!(
                "primary addr ':{}' needs a host",
                self.port
            ))),
        }
    }

    /// "host:port", listening on every address when no host was given
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or("0.0.0.0"), self.port)
    }
}
