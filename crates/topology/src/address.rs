//! Network address type

use std::fmt;
use std::str::FromStr;

use crate::TopologyError;

/// A `host:port` pair identifying where a node listens.
///
/// Equality is structural; no DNS resolution happens here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    /// Hostname or IP literal.
    pub host: String,
    /// TCP port (1..=65535 for a usable address).
    pub port: u16,
}

impl NodeAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether the address could possibly be dialed.
    pub fn is_usable(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TopologyError::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TopologyError::InvalidAddress(s.to_string()))?;
        if host.is_empty() || port == 0 {
            return Err(TopologyError::InvalidAddress(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}
