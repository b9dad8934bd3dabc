//! Network presets and shared configuration types
//!
//! Each component owns its own config struct (with a `Default`); this
//! module holds what they share: the [`Network`] presets, the
//! [`ProtocolConfig`] and [`ConfigError`].

use crate::wire::ServiceFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use thiserror::Error;

/// Protocol version advertised by default
pub const PROTOCOL_VERSION: i32 = 70016;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Known networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Stn,
    Regtest,
}

impl Network {
    /// Magic value as read little-endian from the first 4 header bytes
    pub fn magic(&self) -> u32 {
        match self {
            Network::Mainnet => 0xE8F3_E1E3,
            Network::Testnet => 0xF4F3_E5F4,
            Network::Stn => 0xF9C4_CEFB,
            Network::Regtest => 0xFABF_B5DA,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Stn => 9333,
            Network::Regtest => 18444,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Stn => "stn",
            Network::Regtest => "regtest",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "stn" => Ok(Network::Stn),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Basic protocol settings shared by every component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub network: Network,
    /// Magic expected in (and written to) every header
    pub magic: u32,
    pub port: u16,
    pub protocol_version: i32,
    pub services: ServiceFlags,
    pub user_agent: String,
}

impl ProtocolConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            magic: network.magic(),
            port: network.default_port(),
            protocol_version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK,
            user_agent: format!("/blockwire:{}/", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::for_network(Network::Mainnet)
    }
}

/// Serialize a `Duration` as whole milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
