//! Bidirectional message stream over one peer connection
//!
//! Two tasks per stream:
//! - reader: `FramedRead` + [`MessageDecoder`], handing decoded messages to
//!   the consumer through a bounded channel. When the consumer lags the
//!   channel fills up and the reader stops pulling bytes off the socket.
//! - writer: drains an outbound queue into `FramedWrite` + [`MessageEncoder`].
//!
//! Both tasks stop when the connection is closed. A stream that ends on
//! its own closes the connection: with [`DisconnectReason::Local`] after a
//! protocol error, [`DisconnectReason::Remote`] otherwise.

use crate::network::{BoxedIo, DisconnectReason, PeerAddress, PeerConnection};
use crate::stream::codec::{MessageDecoder, MessageEncoder};
use crate::stream::StreamError;
use crate::wire::BitcoinMsg;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

/// What the reading side of a stream produces
#[derive(Debug)]
pub enum StreamEvent {
    Data(BitcoinMsg),
    /// The stream failed; a `Close` follows
    Error(StreamError),
    Close,
}

/// Snapshot of the writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SerializerStreamState {
    pub msgs_sent: u64,
    pub bytes_sent: u64,
}

#[derive(Default)]
struct SerializerCounters {
    msgs_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

pub struct MessageStream {
    connection: PeerConnection,
    outbound: mpsc::UnboundedSender<BitcoinMsg>,
    counters: Arc<SerializerCounters>,
}

impl MessageStream {
    /// Take the socket out of `connection` and start the reader and writer
    /// tasks. Must be called from within a tokio runtime.
    ///
    /// Returns the stream handle (outbound side) and the receiver of
    /// inbound [`StreamEvent`]s.
    pub fn open(
        connection: PeerConnection,
        decoder: MessageDecoder,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<StreamEvent>), StreamError> {
        let peer = connection.peer();
        let io = connection
            .take_io()
            .ok_or(StreamError::SocketUnavailable(peer))?;
        let (read_half, write_half) = tokio::io::split(io);

        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(SerializerCounters::default());

        tokio::spawn(read_loop(
            connection.clone(),
            FramedRead::new(read_half, decoder),
            events_tx.clone(),
        ));
        tokio::spawn(write_loop(
            connection.clone(),
            FramedWrite::new(write_half, MessageEncoder),
            outbound_rx,
            events_tx,
            Arc::clone(&counters),
        ));

        log::debug!("[{}] Message stream opened", peer);
        Ok((
            Self {
                connection,
                outbound,
                counters,
            },
            events_rx,
        ))
    }

    pub fn peer(&self) -> PeerAddress {
        self.connection.peer()
    }

    /// Queue a message for the writer task. A message that cannot be
    /// encoded is refused here and the stream stays open.
    pub fn send(&self, msg: BitcoinMsg) -> Result<(), StreamError> {
        MessageEncoder::check(&msg)?;
        self.outbound.send(msg).map_err(|_| StreamError::Closed)
    }

    /// Close the underlying connection
    pub fn close(&self) {
        self.connection.close(DisconnectReason::Local);
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn serializer_state(&self) -> SerializerStreamState {
        SerializerStreamState {
            msgs_sent: self.counters.msgs_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("peer", &self.peer())
            .field("serializer", &self.serializer_state())
            .finish()
    }
}

fn close_reason(err: &StreamError) -> DisconnectReason {
    match err {
        StreamError::Wire(_) => DisconnectReason::Local,
        _ => DisconnectReason::Remote,
    }
}

async fn read_loop(
    connection: PeerConnection,
    mut frames: FramedRead<ReadHalf<BoxedIo>, MessageDecoder>,
    events: mpsc::Sender<StreamEvent>,
) {
    let peer = connection.peer();
    let mut reason = DisconnectReason::Remote;

    loop {
        tokio::select! {
            _ = connection.wait_closed() => break,
            frame = frames.next() => match frame {
                Some(Ok(msg)) => {
                    log::trace!("[{}] Received {}", peer, msg.message_type());
                    if events.send(StreamEvent::Data(msg)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("[{}] Stream error: {}", peer, e);
                    reason = close_reason(&e);
                    let _ = events.send(StreamEvent::Error(e)).await;
                    break;
                }
                None => {
                    log::debug!("[{}] Connection closed by peer", peer);
                    break;
                }
            }
        }
    }

    let _ = events.send(StreamEvent::Close).await;
    connection.close(reason);
}

async fn write_loop(
    connection: PeerConnection,
    mut sink: FramedWrite<WriteHalf<BoxedIo>, MessageEncoder>,
    mut outbound: mpsc::UnboundedReceiver<BitcoinMsg>,
    events: mpsc::Sender<StreamEvent>,
    counters: Arc<SerializerCounters>,
) {
    let peer = connection.peer();

    loop {
        tokio::select! {
            _ = connection.wait_closed() => break,
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let command = msg.message_type();
                let bytes = crate::wire::HEADER_SIZE as u64 + msg.header.length as u64;
                match sink.send(msg).await {
                    Ok(()) => {
                        counters.msgs_sent.fetch_add(1, Ordering::Relaxed);
                        counters.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
                        log::trace!("[{}] Sent {}", peer, command);
                    }
                    Err(StreamError::Encode(e)) => {
                        // Nothing was written, the stream is still usable
                        log::warn!("[{}] Dropped unencodable {}: {}", peer, command, e);
                    }
                    Err(e) => {
                        log::warn!("[{}] Failed to send {}: {}", peer, command, e);
                        let reason = close_reason(&e);
                        let _ = events.send(StreamEvent::Error(e)).await;
                        connection.close(reason);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Deserializer, DeserializerConfig};
    use crate::wire::Message;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const MAGIC: u32 = 0xE8F3E1E3;

    fn decoder() -> MessageDecoder {
        let config = DeserializerConfig {
            magic: MAGIC,
            ..Default::default()
        };
        MessageDecoder::new(Arc::new(Deserializer::new(config).unwrap()))
    }

    type Opened = (
        MessageStream,
        mpsc::Receiver<StreamEvent>,
        tokio::io::DuplexStream,
        PeerConnection,
    );

    fn open(capacity: usize) -> Opened {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let connection = PeerConnection::new("10.0.0.1:8333".parse().unwrap(), local, false);
        let (stream, events) = MessageStream::open(connection.clone(), decoder(), capacity).unwrap();
        (stream, events, remote, connection)
    }

    async fn next(events: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_inbound_messages_delivered() {
        let (_stream, mut events, mut remote, _conn) = open(4);
        let ping = BitcoinMsg::new(MAGIC, Message::Ping(42));
        remote.write_all(&ping.to_bytes()).await.unwrap();

        match next(&mut events).await {
            StreamEvent::Data(msg) => assert_eq!(msg, ping),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_outbound_messages_written() {
        let (stream, _events, mut remote, _conn) = open(4);
        let pong = BitcoinMsg::new(MAGIC, Message::Pong(1));
        stream.send(pong.clone()).unwrap();

        let mut buf = vec![0u8; pong.to_bytes().len()];
        timeout(Duration::from_secs(2), remote.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, pong.to_bytes());

        // Counter is bumped right after the write completes
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stream.serializer_state().msgs_sent, 1);
    }

    #[tokio::test]
    async fn test_unencodable_message_refused_without_closing() {
        let (stream, mut events, mut remote, conn) = open(4);
        let bad = BitcoinMsg::new(
            MAGIC,
            Message::Unknown {
                command: "sendcmpctxyz1".to_string(),
                payload: vec![],
            },
        );
        assert!(matches!(stream.send(bad), Err(StreamError::Encode(_))));

        // The stream keeps working
        let pong = BitcoinMsg::new(MAGIC, Message::Pong(2));
        stream.send(pong.clone()).unwrap();
        let mut buf = vec![0u8; pong.to_bytes().len()];
        timeout(Duration::from_secs(2), remote.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, pong.to_bytes());
        assert!(!conn.is_closed());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_magic_errors_then_closes() {
        let (_stream, mut events, mut remote, conn) = open(4);
        let foreign = BitcoinMsg::new(0xFABFB5DA, Message::VerAck);
        remote.write_all(&foreign.to_bytes()).await.unwrap();

        assert!(matches!(next(&mut events).await, StreamEvent::Error(StreamError::Wire(_))));
        assert!(matches!(next(&mut events).await, StreamEvent::Close));
        conn.wait_closed().await;
        assert_eq!(conn.close_reason(), Some(DisconnectReason::Local));
    }

    #[tokio::test]
    async fn test_remote_eof_closes_as_remote() {
        let (_stream, mut events, remote, conn) = open(4);
        drop(remote);
        assert!(matches!(next(&mut events).await, StreamEvent::Close));
        conn.wait_closed().await;
        assert_eq!(conn.close_reason(), Some(DisconnectReason::Remote));
    }

    #[tokio::test]
    async fn test_reader_pauses_when_consumer_lags() {
        let (_stream, mut events, mut remote, _conn) = open(1);
        for nonce in 0..5u64 {
            let bytes = BitcoinMsg::new(MAGIC, Message::Ping(nonce)).to_bytes();
            remote.write_all(&bytes).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Nothing is lost or reordered while the reader was parked
        for nonce in 0..5u64 {
            match next(&mut events).await {
                StreamEvent::Data(msg) => assert_eq!(msg.body, Message::Ping(nonce)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_local_close_stops_tasks() {
        let (stream, mut events, _remote, conn) = open(4);
        stream.close();
        assert!(matches!(next(&mut events).await, StreamEvent::Close));
        assert_eq!(conn.close_reason(), Some(DisconnectReason::Local));
        assert!(stream.is_closed());
    }
}
