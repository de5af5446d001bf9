//! Core types shared by the client router and the server dispatcher.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a cache topology. Strictly monotonic per cache.
pub type TopologyId = i32;

/// Index of a segment in `[0, num_segments)`.
pub type SegmentId = u32;

/// Name of the cache an operation targets. The default cache has an empty name.
pub type CacheName = str;

/// A server address. Identity is host + port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or IP literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in '{}'", s))?;
        if host.is_empty() {
            return Err(format!("missing host in '{}'", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in '{}': {}", s, e))?;
        Ok(Self::new(host, port))
    }
}

/// Cross-node ordering a sender requests for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeliverOrder {
    /// No ordering.
    #[default]
    None,
    /// Ordered per sender channel.
    PerSender,
    /// Total order across the cluster.
    Total,
}

/// Transaction locking mode of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockingMode {
    /// Locks are acquired at prepare time.
    #[default]
    Optimistic,
    /// Locks are acquired eagerly, before prepare.
    Pessimistic,
}

/// Global transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(Uuid);

impl TxId {
    /// Generate a fresh random transaction id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing id.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0.simple())
    }
}
