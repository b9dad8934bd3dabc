//! P2P networking layer
//!
//! TCP listener and dialing, per-peer connection handles and the
//! [`NetworkHandler`] that turns socket lifecycle into bus events.

pub mod connection;
pub mod handler;
pub mod peer;
pub mod server;

pub use connection::{BoxedIo, PeerConnection, PeerIo};
pub use handler::{NetworkConfig, NetworkHandler};
pub use peer::{DisconnectReason, NetworkError, PeerAddress};
pub use server::{connect_to_peer, Server};
