//! Peer identity and connection errors

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Network layer errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Connection to {0} timed out")]
    Timeout(PeerAddress),
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("Peer {0} is already connected")]
    AlreadyConnected(PeerAddress),
    #[error("Host {0} is blacklisted")]
    Blacklisted(IpAddr),
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),
}

/// Host and port of one remote endpoint. Used as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    ip: IpAddr,
    port: u16,
}

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        // Normalise IPv4-mapped addresses so both forms key the same peer
        let ip = match addr.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        Self::new(ip, addr.port())
    }
}

impl FromStr for PeerAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(PeerAddress::from)
            .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", s, e)))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Why a peer was disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Undefined,
    /// We requested the disconnection
    Local,
    /// The remote side closed the connection
    Remote,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::Undefined => "undefined",
            DisconnectReason::Local => "disconnected by local",
            DisconnectReason::Remote => "disconnected by remote",
        };
        write!(f, "{}", s)
    }
}
