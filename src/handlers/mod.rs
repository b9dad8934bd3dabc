//! Handlers running on top of the event bus
//!
//! - [`MessageHandler`]: peer registry, message streams, send/broadcast
//! - [`PingPongHandler`]: per-peer liveness checks
//! - [`BlacklistHandler`]: ban policy for misbehaving hosts

pub mod blacklist;
pub mod message;
pub mod ping_pong;

pub use blacklist::{BlacklistConfig, BlacklistHandler, BlacklistHandlerState};
pub use message::{MessageHandler, MessageHandlerState, MessagePeerInfo};
pub use ping_pong::{PingPongConfig, PingPongHandler, PingPongHandlerState, PingPongPeerInfo};
