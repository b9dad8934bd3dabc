//! Blockwire: peer-to-peer networking core for a Bitcoin-style node
//!
//! This crate provides:
//! - The binary wire codec (header, checksum, typed message bodies)
//! - A synchronous/pooled event bus every component talks through
//! - Per-peer message streams with backpressure
//! - Streaming deserialization of oversized blocks in batches
//! - Peer registry with send/broadcast, ping-pong liveness and blacklisting
//!
//! # Example
//!
//! ```no_run
//! use blockwire::config::Network;
//! use blockwire::events::{Event, EventKind};
//! use blockwire::node::{Node, NodeConfig};
//! use blockwire::wire::MessageType;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::new(NodeConfig::for_network(Network::Regtest))?;
//! node.subscribe(EventKind::MsgReceived(MessageType::Inv), |event| {
//!     if let Event::MsgReceived { peer, msg } = event {
//!         println!("inv from {}: {:?}", peer, msg.body);
//!     }
//! });
//! node.start().await?;
//! node.connect_to("127.0.0.1:18444".parse()?).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod events;
pub mod handlers;
pub mod network;
pub mod node;
pub mod stream;
pub mod wire;

// Re-export commonly used types
pub use config::{ConfigError, Network, ProtocolConfig};
pub use events::{DispatchMode, Event, EventBus, EventKind};
pub use handlers::{BlacklistHandler, MessageHandler, PingPongHandler};
pub use network::{DisconnectReason, NetworkHandler, PeerAddress};
pub use node::{Node, NodeConfig};
pub use wire::{BitcoinMsg, Message, MessageType};
