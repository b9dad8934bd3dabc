//! Message Handler: the peer registry
//!
//! Wraps every connected peer in a [`MessageStream`], publishes what the
//! peers send and executes outbound send/broadcast requests.
//!
//! Subscribes to:
//! - `PeerStreamConnected`: open a stream and register the peer
//! - `PeerDisconnected`: drop the peer
//! - `SendMsgRequest` / `BroadcastMsgRequest`
//!
//! Publishes `PeerMsgReady`, `MsgReceived`, `MsgSent`, the partial block
//! events of streamed blocks, `PeerStreamError` when a peer's stream
//! fails, and `DisconnectPeerRequest` after a stream failure or a message
//! that does not validate.

use crate::config::ConfigError;
use crate::events::{Event, EventBus, EventKind};
use crate::network::{PeerAddress, PeerConnection};
use crate::stream::large::{LargeMsgEvent, Notifier, PartialMessage};
use crate::stream::{
    Deserializer, DeserializerConfig, DeserializerState, MessageDecoder, MessageEncoder,
    MessageStream, PreDecodeHook, SerializerStreamState, StreamError, StreamEvent,
};
use crate::wire::BitcoinMsg;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A registered peer
#[derive(Debug)]
pub struct MessagePeerInfo {
    stream: MessageStream,
    msgs_in: AtomicU64,
    msgs_out: AtomicU64,
}

impl MessagePeerInfo {
    fn new(stream: MessageStream) -> Self {
        Self {
            stream,
            msgs_in: AtomicU64::new(0),
            msgs_out: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> PeerAddress {
        self.stream.peer()
    }

    pub fn msgs_in(&self) -> u64 {
        self.msgs_in.load(Ordering::Relaxed)
    }

    pub fn msgs_out(&self) -> u64 {
        self.msgs_out.load(Ordering::Relaxed)
    }

    pub fn serializer_state(&self) -> SerializerStreamState {
        self.stream.serializer_state()
    }

    fn send(&self, msg: BitcoinMsg) -> Result<(), StreamError> {
        self.stream.send(msg)?;
        self.msgs_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Snapshot of the handler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageHandlerState {
    pub msgs_in: u64,
    pub msgs_out: u64,
    pub deserializer: DeserializerState,
}

pub struct MessageHandler {
    bus: EventBus,
    deserializer: Arc<Deserializer>,
    pre_decode: RwLock<Option<PreDecodeHook>>,
    peers: RwLock<HashMap<PeerAddress, Arc<MessagePeerInfo>>>,
    state: Mutex<MessageHandlerState>,
}

impl MessageHandler {
    /// Create the handler and subscribe it to the bus. Fails on an invalid
    /// deserializer configuration.
    pub fn new(bus: EventBus, config: DeserializerConfig) -> Result<Arc<Self>, ConfigError> {
        let deserializer = Arc::new(Deserializer::new(config)?);
        let handler = Arc::new(Self {
            bus,
            deserializer,
            pre_decode: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            state: Mutex::new(MessageHandlerState::default()),
        });
        handler.register_for_events();
        Ok(handler)
    }

    fn register_for_events(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.subscribe(&weak, EventKind::PeerStreamConnected, |h, event| {
            if let Event::PeerStreamConnected { connection, .. } = event {
                h.on_peer_stream_connected(connection);
            }
        });
        self.subscribe(&weak, EventKind::PeerDisconnected, |h, event| {
            if let Event::PeerDisconnected { peer, reason } = event {
                log::trace!("[{}] Peer disconnected ({})", peer, reason);
                h.remove_peer(peer, None);
            }
        });
        self.subscribe(&weak, EventKind::SendMsgRequest, |h, event| {
            if let Event::SendMsgRequest { peer, msg } = event {
                h.send(*peer, msg.clone());
            }
        });
        self.subscribe(&weak, EventKind::BroadcastMsgRequest, |h, event| {
            if let Event::BroadcastMsgRequest { msg } = event {
                h.broadcast(msg.clone());
            }
        });
        self.subscribe(&weak, EventKind::NetStop, |h, _| {
            log::debug!("Message handler stopping, {} peers registered", h.peer_count());
        });
    }

    fn subscribe<F>(&self, weak: &Weak<Self>, kind: EventKind, f: F)
    where
        F: Fn(&Arc<Self>, &Event) + Send + Sync + 'static,
    {
        let weak = weak.clone();
        self.bus.subscribe(kind, move |event| {
            if let Some(handler) = weak.upgrade() {
                f(&handler, event);
            }
        });
    }

    /// Install a transform applied to raw bytes of streams opened from now on
    pub fn set_pre_decode(&self, hook: PreDecodeHook) {
        *self
            .pre_decode
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn deserializer(&self) -> &Arc<Deserializer> {
        &self.deserializer
    }

    /// Send `msg` to one peer. Unknown peers are ignored.
    pub fn send(&self, peer: PeerAddress, msg: BitcoinMsg) {
        let Some(info) = self.peer_info(&peer) else {
            log::trace!("[{}] Request to send {} discarded (unknown peer)", peer, msg.message_type());
            return;
        };
        if let Err(e) = info.send(msg.clone()) {
            log::debug!("[{}] Could not send {}: {}", peer, msg.message_type(), e);
            return;
        }
        // Reaches both the per-type and the generic subscribers
        self.bus.publish(Event::MsgSent { peer, msg });
        self.update_state(0, 1);
    }

    /// Send `msg` to every registered peer
    pub fn broadcast(&self, msg: BitcoinMsg) {
        if let Err(e) = MessageEncoder::check(&msg) {
            log::warn!("Broadcast of {} discarded: {}", msg.message_type(), e);
            return;
        }
        let peers: Vec<Arc<MessagePeerInfo>> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for info in &peers {
            if let Err(e) = info.send(msg.clone()) {
                log::debug!("[{}] Broadcast of {} failed: {}", info.peer(), msg.message_type(), e);
            }
        }
        self.update_state(0, peers.len() as u64);
    }

    pub fn state(&self) -> MessageHandlerState {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        MessageHandlerState {
            deserializer: self.deserializer.state(),
            ..state
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn peers(&self) -> Vec<PeerAddress> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn peer_info(&self, peer: &PeerAddress) -> Option<Arc<MessagePeerInfo>> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
    }

    fn on_peer_stream_connected(self: &Arc<Self>, connection: &PeerConnection) {
        let peer = connection.peer();
        if Handle::try_current().is_err() {
            log::error!("[{}] Cannot open message stream outside a tokio runtime", peer);
            return;
        }

        let mut decoder = MessageDecoder::new(Arc::clone(&self.deserializer))
            .with_notifier(self.partial_notifier(peer));
        if let Some(hook) = self
            .pre_decode
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            decoder = decoder.with_pre_decode(hook);
        }

        let capacity = self.deserializer.config().stream_capacity;
        let (stream, events) = match MessageStream::open(connection.clone(), decoder, capacity) {
            Ok(opened) => opened,
            Err(e) => {
                log::warn!("[{}] Could not open message stream: {}", peer, e);
                return;
            }
        };

        let info = Arc::new(MessagePeerInfo::new(stream));
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, Arc::clone(&info));
        tokio::spawn(Arc::clone(self).consume_stream(info, events));

        log::trace!("[{}] Peer stream connected", peer);
        self.bus.publish(Event::PeerMsgReady { peer });
    }

    fn partial_notifier(&self, peer: PeerAddress) -> Notifier {
        let bus = self.bus.clone();
        Notifier::new(self.deserializer.config().callback_mode, move |event| match event {
            LargeMsgEvent::Partial(PartialMessage::BlockHeader(part)) => {
                bus.publish(Event::PartialBlockHeaderReceived { peer, part })
            }
            LargeMsgEvent::Partial(PartialMessage::BlockTxs(part)) => {
                bus.publish(Event::PartialBlockTxsReceived { peer, part })
            }
            LargeMsgEvent::Error(e) => {
                log::warn!("[{}] Streamed message aborted: {}", peer, e);
            }
        })
    }

    async fn consume_stream(
        self: Arc<Self>,
        info: Arc<MessagePeerInfo>,
        mut events: mpsc::Receiver<StreamEvent>,
    ) {
        let peer = info.peer();
        let mut errored = false;
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Data(msg) => self.on_stream_msg_received(&info, msg),
                StreamEvent::Error(e) => {
                    // Reader and writer may both fail; one request is enough
                    if !errored {
                        errored = true;
                        self.on_stream_error(&info, &e);
                    }
                }
                StreamEvent::Close => self.remove_peer(&peer, Some(&info)),
            }
        }
    }

    fn on_stream_msg_received(&self, info: &MessagePeerInfo, msg: BitcoinMsg) {
        let peer = info.peer();
        log::trace!("[{}] {} msg received", peer, msg.message_type());
        if let Some(error) = self.find_error_in_msg(&msg) {
            log::debug!("[{}] Invalid incoming msg: {}", peer, error);
            self.bus.publish(Event::DisconnectPeerRequest {
                peer,
                reason: Some(error),
            });
            return;
        }
        info.msgs_in.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(Event::MsgReceived { peer, msg });
        self.update_state(1, 0);
    }

    fn on_stream_error(&self, info: &Arc<MessagePeerInfo>, error: &StreamError) {
        let peer = info.peer();
        log::debug!("[{}] Stream error, requesting disconnection: {}", peer, error);
        self.remove_peer(&peer, Some(info));
        self.bus.publish(Event::PeerStreamError {
            peer,
            reason: error.to_string(),
        });
        // Only inbound protocol violations carry a reason
        let reason = match error {
            StreamError::Wire(e) => Some(e.to_string()),
            _ => None,
        };
        self.bus.publish(Event::DisconnectPeerRequest { peer, reason });
    }

    /// Remove `peer`. With `expected`, only if that is still the registered
    /// entry (a reconnected peer keeps its new stream).
    fn remove_peer(&self, peer: &PeerAddress, expected: Option<&Arc<MessagePeerInfo>>) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let matches = match (peers.get(peer), expected) {
            (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            peers.remove(peer);
            log::trace!("[{}] Removed from registry", peer);
        }
    }

    fn find_error_in_msg(&self, msg: &BitcoinMsg) -> Option<String> {
        let magic = self.deserializer.magic();
        if msg.header.magic != magic {
            return Some(format!(
                "Network id is incorrect: expected {:#010x}, got {:#010x}",
                magic, msg.header.magic
            ));
        }
        if msg.header.command != msg.body.command() {
            return Some(format!(
                "Command '{}' does not match body '{}'",
                msg.header.command,
                msg.body.command()
            ));
        }
        None
    }

    fn update_state(&self, msgs_in: u64, msgs_out: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = MessageHandlerState {
            msgs_in: state.msgs_in + msgs_in,
            msgs_out: state.msgs_out + msgs_out,
            deserializer: self.deserializer.state(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DispatchMode;
    use crate::wire::{Message, MessageType};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    const MAGIC: u32 = 0xE8F3E1E3;

    fn handler(bus: &EventBus) -> Arc<MessageHandler> {
        let config = DeserializerConfig {
            magic: MAGIC,
            ..Default::default()
        };
        MessageHandler::new(bus.clone(), config).unwrap()
    }

    fn recorder(bus: &EventBus, kind: EventKind) -> mpsc::UnboundedReceiver<Option<PeerAddress>> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(kind, move |event| {
            let _ = tx.send(event.peer());
        });
        rx
    }

    fn connect(bus: &EventBus, addr: &str) -> (PeerAddress, DuplexStream) {
        let peer: PeerAddress = addr.parse().unwrap();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        bus.publish(Event::PeerStreamConnected {
            peer,
            connection: PeerConnection::new(peer, local, true),
        });
        (peer, remote)
    }

    async fn read_msg(remote: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(Duration::from_secs(2), remote.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_missing_batch_size_fails_construction() {
        let config = DeserializerConfig {
            large_msg_batch_size: None,
            ..Default::default()
        };
        assert!(MessageHandler::new(EventBus::new(DispatchMode::Inline), config).is_err());
    }

    #[tokio::test]
    async fn test_stream_connected_registers_peer() {
        let bus = EventBus::new(DispatchMode::Inline);
        let handler = handler(&bus);
        let mut ready = recorder(&bus, EventKind::PeerMsgReady);

        let (peer, _remote) = connect(&bus, "10.0.0.1:8333");
        assert_eq!(recv(&mut ready).await, Some(peer));
        assert_eq!(handler.peers(), vec![peer]);
    }

    #[tokio::test]
    async fn test_received_messages_published() {
        let bus = EventBus::new(DispatchMode::Inline);
        let handler = handler(&bus);
        let mut pings = recorder(&bus, EventKind::MsgReceived(MessageType::Ping));
        let mut any = recorder(&bus, EventKind::AnyMsgReceived);

        let (peer, mut remote) = connect(&bus, "10.0.0.1:8333");
        remote
            .write_all(&BitcoinMsg::new(MAGIC, Message::Ping(5)).to_bytes())
            .await
            .unwrap();

        assert_eq!(recv(&mut pings).await, Some(peer));
        assert_eq!(recv(&mut any).await, Some(peer));
        assert_eq!(handler.state().msgs_in, 1);
        assert_eq!(handler.peer_info(&peer).unwrap().msgs_in(), 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_noop() {
        let bus = EventBus::new(DispatchMode::Inline);
        let handler = handler(&bus);
        let mut sent = recorder(&bus, EventKind::AnyMsgSent);

        handler.send(
            "10.9.9.9:8333".parse().unwrap(),
            BitcoinMsg::new(MAGIC, Message::VerAck),
        );

        assert_eq!(handler.state(), MessageHandlerState::default());
        assert_eq!(handler.peer_count(), 0);
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_request_writes_and_publishes() {
        let bus = EventBus::new(DispatchMode::Inline);
        let handler = handler(&bus);
        let mut sent = recorder(&bus, EventKind::MsgSent(MessageType::VerAck));

        let (peer, mut remote) = connect(&bus, "10.0.0.1:8333");
        let verack = BitcoinMsg::new(MAGIC, Message::VerAck);
        bus.publish(Event::SendMsgRequest {
            peer,
            msg: verack.clone(),
        });

        assert_eq!(read_msg(&mut remote, 24).await, verack.to_bytes());
        assert_eq!(recv(&mut sent).await, Some(peer));
        assert_eq!(handler.state().msgs_out, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer_once() {
        let bus = EventBus::new(DispatchMode::Inline);
        let handler = handler(&bus);
        let (_, mut a) = connect(&bus, "10.0.0.1:8333");
        let (_, mut b) = connect(&bus, "10.0.0.2:8333");

        let ping = BitcoinMsg::new(MAGIC, Message::Ping(9));
        let len = ping.to_bytes().len();
        handler.broadcast(ping.clone());

        assert_eq!(read_msg(&mut a, len).await, ping.to_bytes());
        assert_eq!(read_msg(&mut b, len).await, ping.to_bytes());
        assert_eq!(handler.state().msgs_out, 2);

        // Nothing else was written
        let mut extra = [0u8; 1];
        assert!(timeout(Duration::from_millis(100), a.read(&mut extra))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stream_error_removes_only_that_peer() {
        let bus = EventBus::new(DispatchMode::Inline);
        let handler = handler(&bus);
        let mut disconnects = recorder(&bus, EventKind::DisconnectPeerRequest);
        let mut received = recorder(&bus, EventKind::AnyMsgReceived);

        let (a, mut remote_a) = connect(&bus, "10.0.0.1:8333");
        let (b, _remote_b) = connect(&bus, "10.0.0.2:8333");

        // Foreign magic: a protocol error on A's stream
        remote_a
            .write_all(&BitcoinMsg::new(0xFABFB5DA, Message::Ping(1)).to_bytes())
            .await
            .unwrap();

        assert_eq!(recv(&mut disconnects).await, Some(a));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(disconnects.try_recv().is_err());
        assert!(received.try_recv().is_err());
        assert_eq!(handler.peers(), vec![b]);
    }

    #[tokio::test]
    async fn test_invalid_magic_not_forwarded() {
        let bus = EventBus::new(DispatchMode::Inline);
        let handler = handler(&bus);
        let mut disconnects = recorder(&bus, EventKind::DisconnectPeerRequest);
        let mut received = recorder(&bus, EventKind::AnyMsgReceived);

        let (peer, _remote) = connect(&bus, "10.0.0.1:8333");
        let info = handler.peer_info(&peer).unwrap();
        handler.on_stream_msg_received(&info, BitcoinMsg::new(0x0B110907, Message::VerAck));

        assert_eq!(recv(&mut disconnects).await, Some(peer));
        assert!(received.try_recv().is_err());
        assert_eq!(handler.state().msgs_in, 0);
    }

    #[tokio::test]
    async fn test_peer_disconnected_removes_peer() {
        let bus = EventBus::new(DispatchMode::Inline);
        let handler = handler(&bus);
        let (peer, _remote) = connect(&bus, "10.0.0.1:8333");
        assert_eq!(handler.peer_count(), 1);

        bus.publish(Event::PeerDisconnected {
            peer,
            reason: crate::network::DisconnectReason::Remote,
        });
        assert_eq!(handler.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_unencodable_send_not_blamed_on_peer() {
        let bus = EventBus::new(DispatchMode::Inline);
        let handler = handler(&bus);
        let blacklist = crate::handlers::BlacklistHandler::new(
            bus.clone(),
            crate::handlers::BlacklistConfig {
                threshold: 1,
                trusted: vec![],
            },
        );
        let mut disconnects = recorder(&bus, EventKind::DisconnectPeerRequest);

        let (peer, mut remote) = connect(&bus, "10.0.0.1:8333");
        let bad = BitcoinMsg::new(
            MAGIC,
            Message::Unknown {
                command: "sendcmpctxyz1".to_string(),
                payload: vec![1, 2],
            },
        );
        handler.send(peer, bad.clone());
        handler.broadcast(bad);

        // The connection stays usable
        let verack = BitcoinMsg::new(MAGIC, Message::VerAck);
        handler.send(peer, verack.clone());
        assert_eq!(read_msg(&mut remote, 24).await, verack.to_bytes());

        assert!(disconnects.try_recv().is_err());
        assert!(!blacklist.is_blacklisted(&peer.ip()));
        assert_eq!(handler.peers(), vec![peer]);
        assert_eq!(handler.state().msgs_out, 1);
    }

    #[tokio::test]
    async fn test_stream_failure_published_before_disconnect() {
        let bus = EventBus::new(DispatchMode::Inline);
        let _handler = handler(&bus);
        let (tx, mut order) = mpsc::unbounded_channel();
        for kind in [EventKind::PeerStreamError, EventKind::DisconnectPeerRequest] {
            let tx = tx.clone();
            bus.subscribe(kind, move |event| {
                let _ = tx.send(event.kind());
            });
        }

        let (_, mut remote) = connect(&bus, "10.0.0.1:8333");
        remote
            .write_all(&BitcoinMsg::new(0xFABFB5DA, Message::Ping(1)).to_bytes())
            .await
            .unwrap();

        assert_eq!(recv(&mut order).await, EventKind::PeerStreamError);
        assert_eq!(recv(&mut order).await, EventKind::DisconnectPeerRequest);
    }
}
