//! Event catalogue
//!
//! Every interaction between components is one of these events. Handlers
//! subscribe by [`EventKind`]; message events additionally match their
//! generic supertype ([`EventKind::AnyMsgReceived`] / [`EventKind::AnyMsgSent`]).

use crate::network::{DisconnectReason, PeerAddress, PeerConnection};
use crate::stream::large::{PartialBlockHeader, PartialBlockTxs};
use crate::wire::{BitcoinMsg, MessageType};
use std::net::IpAddr;

#[derive(Debug)]
pub enum Event {
    /// The node has started
    NetStart,
    /// The node is stopping
    NetStop,

    /// A TCP connection has been established
    PeerConnected { peer: PeerAddress, inbound: bool },
    /// A connection is ready to be wrapped in a message stream
    PeerStreamConnected {
        peer: PeerAddress,
        connection: PeerConnection,
    },
    /// A connection attempt failed or was refused
    PeerRejected { peer: PeerAddress, reason: String },
    PeerDisconnected {
        peer: PeerAddress,
        reason: DisconnectReason,
    },
    /// The peer's message stream is attached and can carry messages
    PeerMsgReady { peer: PeerAddress },
    /// The peer's message stream failed (protocol or transport error).
    /// `PeerDisconnected` follows.
    PeerStreamError { peer: PeerAddress, reason: String },

    MsgReceived { peer: PeerAddress, msg: BitcoinMsg },
    MsgSent { peer: PeerAddress, msg: BitcoinMsg },
    PartialBlockHeaderReceived {
        peer: PeerAddress,
        part: PartialBlockHeader,
    },
    PartialBlockTxsReceived {
        peer: PeerAddress,
        part: PartialBlockTxs,
    },

    SendMsgRequest { peer: PeerAddress, msg: BitcoinMsg },
    BroadcastMsgRequest { msg: BitcoinMsg },
    ConnectPeerRequest { peer: PeerAddress },
    DisconnectPeerRequest {
        peer: PeerAddress,
        reason: Option<String>,
    },

    PeersBlacklisted { hosts: Vec<IpAddr> },
    PeersWhitelisted { hosts: Vec<IpAddr> },
}

/// Subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NetStart,
    NetStop,
    PeerConnected,
    PeerStreamConnected,
    PeerRejected,
    PeerDisconnected,
    PeerMsgReady,
    PeerStreamError,
    /// Received message of one specific type
    MsgReceived(MessageType),
    /// Any received message
    AnyMsgReceived,
    MsgSent(MessageType),
    AnyMsgSent,
    PartialBlockHeaderReceived,
    PartialBlockTxsReceived,
    SendMsgRequest,
    BroadcastMsgRequest,
    ConnectPeerRequest,
    DisconnectPeerRequest,
    PeersBlacklisted,
    PeersWhitelisted,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NetStart => EventKind::NetStart,
            Event::NetStop => EventKind::NetStop,
            Event::PeerConnected { .. } => EventKind::PeerConnected,
            Event::PeerStreamConnected { .. } => EventKind::PeerStreamConnected,
            Event::PeerRejected { .. } => EventKind::PeerRejected,
            Event::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            Event::PeerMsgReady { .. } => EventKind::PeerMsgReady,
            Event::PeerStreamError { .. } => EventKind::PeerStreamError,
            Event::MsgReceived { msg, .. } => EventKind::MsgReceived(msg.message_type()),
            Event::MsgSent { msg, .. } => EventKind::MsgSent(msg.message_type()),
            Event::PartialBlockHeaderReceived { .. } => EventKind::PartialBlockHeaderReceived,
            Event::PartialBlockTxsReceived { .. } => EventKind::PartialBlockTxsReceived,
            Event::SendMsgRequest { .. } => EventKind::SendMsgRequest,
            Event::BroadcastMsgRequest { .. } => EventKind::BroadcastMsgRequest,
            Event::ConnectPeerRequest { .. } => EventKind::ConnectPeerRequest,
            Event::DisconnectPeerRequest { .. } => EventKind::DisconnectPeerRequest,
            Event::PeersBlacklisted { .. } => EventKind::PeersBlacklisted,
            Event::PeersWhitelisted { .. } => EventKind::PeersWhitelisted,
        }
    }

    /// Generic kind this event is also delivered under
    pub fn supertype(&self) -> Option<EventKind> {
        match self {
            Event::MsgReceived { .. } => Some(EventKind::AnyMsgReceived),
            Event::MsgSent { .. } => Some(EventKind::AnyMsgSent),
            _ => None,
        }
    }

    /// Peer this event concerns, if any
    pub fn peer(&self) -> Option<PeerAddress> {
        match self {
            Event::PeerConnected { peer, .. }
            | Event::PeerStreamConnected { peer, .. }
            | Event::PeerRejected { peer, .. }
            | Event::PeerDisconnected { peer, .. }
            | Event::PeerMsgReady { peer }
            | Event::PeerStreamError { peer, .. }
            | Event::MsgReceived { peer, .. }
            | Event::MsgSent { peer, .. }
            | Event::PartialBlockHeaderReceived { peer, .. }
            | Event::PartialBlockTxsReceived { peer, .. }
            | Event::SendMsgRequest { peer, .. }
            | Event::ConnectPeerRequest { peer }
            | Event::DisconnectPeerRequest { peer, .. } => Some(*peer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Message;

    #[test]
    fn test_message_events_have_supertype() {
        let peer: PeerAddress = "127.0.0.1:8333".parse().unwrap();
        let event = Event::MsgReceived {
            peer,
            msg: BitcoinMsg::new(1, Message::Ping(3)),
        };
        assert_eq!(event.kind(), EventKind::MsgReceived(MessageType::Ping));
        assert_eq!(event.supertype(), Some(EventKind::AnyMsgReceived));
        assert_eq!(event.peer(), Some(peer));
    }

    #[test]
    fn test_control_events_have_no_supertype() {
        let event = Event::DisconnectPeerRequest {
            peer: "127.0.0.1:8333".parse().unwrap(),
            reason: None,
        };
        assert_eq!(event.kind(), EventKind::DisconnectPeerRequest);
        assert_eq!(event.supertype(), None);
        assert_eq!(Event::NetStart.peer(), None);

        let peer: PeerAddress = "127.0.0.1:8333".parse().unwrap();
        let failed = Event::PeerStreamError {
            peer,
            reason: "IO error".to_string(),
        };
        assert_eq!(failed.kind(), EventKind::PeerStreamError);
        assert_eq!(failed.peer(), Some(peer));
    }
}
