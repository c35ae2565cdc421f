//! Node identity: `host/port` node ids and connection peer keys.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Server identifier in `host/port` form. Used as the primary/replica marker in
/// version records and as the key of the peer roster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    host: String,
    port: u16,
}

impl NodeId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a dialable `host:port` address (the config file form).
    pub fn from_addr(addr: &str) -> Result<Self, NodeIdError> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| NodeIdError::Malformed(addr.to_string()))?;
        Self::from_parts(host, port, addr)
    }

    fn from_parts(host: &str, port: &str, raw: &str) -> Result<Self, NodeIdError> {
        if host.is_empty() {
            return Err(NodeIdError::Malformed(raw.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| NodeIdError::Malformed(raw.to_string()))?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for NodeId {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once('/')
            .ok_or_else(|| NodeIdError::Malformed(s.to_string()))?;
        Self::from_parts(host, port, s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = NodeIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeIdError {
    #[error("malformed node id or address: {0:?}")]
    Malformed(String),
}

/// Who is on the other end of a connection. Servers are identified by the node id they
/// announce in the handshake; everything else is a client keyed by socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Server(NodeId),
    Client(SocketAddr),
}

impl PeerKey {
    pub fn server(&self) -> Option<&NodeId> {
        match self {
            PeerKey::Server(node) => Some(node),
            PeerKey::Client(_) => None,
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKey::Server(node) => write!(f, "server {}", node),
            PeerKey::Client(addr) => write!(f, "client {}", addr),
        }
    }
}
