//! Per-peer message streams
//!
//! - [`Deserializer`]: settings, counters and large-message registry shared
//!   by every stream
//! - [`MessageDecoder`] / [`MessageEncoder`]: framing codec
//! - [`MessageStream`]: reader and writer tasks bound to one connection
//! - [`large`]: streaming deserialization of oversized bodies

pub mod codec;
pub mod deserializer;
pub mod large;
pub mod message_stream;

pub use codec::{MessageDecoder, MessageEncoder, PreDecodeHook};
pub use deserializer::{Deserializer, DeserializerConfig, DeserializerState};
pub use message_stream::{MessageStream, SerializerStreamState, StreamEvent};

use crate::network::PeerAddress;
use crate::wire::WireError;
use thiserror::Error;

/// Stream errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Protocol error: {0}")]
    Wire(#[from] WireError),
    /// An outbound message we could not encode; the peer is not at fault
    #[error("Cannot encode outbound message: {0}")]
    Encode(WireError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Socket of {0} is already in use")]
    SocketUnavailable(PeerAddress),
    #[error("Stream closed")]
    Closed,
}
