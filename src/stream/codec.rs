//! Framing codec used by each peer stream
//!
//! [`MessageDecoder`] turns raw socket bytes into [`BitcoinMsg`]s. It reads
//! the 24-byte header, checks the magic, then either buffers the body and
//! decodes it in one go, or (for large bodies with a registered streaming
//! deserializer) feeds the body bytes to that deserializer as they arrive
//! and reports its partial results through a [`Notifier`].
//!
//! [`MessageEncoder`] writes a message back into wire format.

use crate::crypto::ChecksumHasher;
use crate::stream::large::{LargeMessageDecoding, LargeMsgEvent, Notifier, PartialMessage};
use crate::stream::{Deserializer, StreamError};
use crate::wire::header::encode_command;
use crate::wire::{BitcoinMsg, Encode, MessageHeader, WireError, HEADER_SIZE};
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Transforms raw bytes before they are decoded
pub type PreDecodeHook = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

// Largest chunk reserved up front while streaming a body
const STREAM_CHUNK: usize = 64 * 1024;

enum DecodeState {
    Header,
    Body(MessageHeader),
    Large(LargeProgress),
}

struct LargeProgress {
    header: MessageHeader,
    remaining: u64,
    decoding: Box<dyn LargeMessageDecoding>,
    hasher: ChecksumHasher,
}

pub struct MessageDecoder {
    deserializer: Arc<Deserializer>,
    notifier: Option<Notifier>,
    pre_decode: Option<PreDecodeHook>,
    /// Bytes at the front of the buffer already passed through `pre_decode`
    seen: usize,
    state: DecodeState,
}

impl MessageDecoder {
    pub fn new(deserializer: Arc<Deserializer>) -> Self {
        Self {
            deserializer,
            notifier: None,
            pre_decode: None,
            seen: 0,
            state: DecodeState::Header,
        }
    }

    /// Receiver of large-message notifications. Without one, streamed
    /// bodies are still decoded and validated but their parts are dropped.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_pre_decode(mut self, hook: PreDecodeHook) -> Self {
        self.pre_decode = Some(hook);
        self
    }

    /// True while a streamed body is being decoded
    pub fn in_large_message(&self) -> bool {
        matches!(self.state, DecodeState::Large(_))
    }

    fn apply_pre_decode(&mut self, src: &mut BytesMut) {
        let Some(hook) = &self.pre_decode else {
            return;
        };
        if src.len() > self.seen {
            let fresh = src.split_off(self.seen);
            src.extend_from_slice(&hook(&fresh));
            self.seen = src.len();
        }
    }

    fn notify_error(&self, err: &WireError) {
        self.deserializer.record_large_failed();
        if let Some(notifier) = &self.notifier {
            notifier.notify(LargeMsgEvent::Error(err.clone()));
        }
    }

    fn notify_parts(&self, parts: Vec<PartialMessage>) {
        if parts.is_empty() {
            return;
        }
        self.deserializer.record_partials(parts.len());
        if let Some(notifier) = &self.notifier {
            for part in parts {
                notifier.notify(LargeMsgEvent::Partial(part));
            }
        }
    }

    fn read_header(&mut self, src: &mut BytesMut) -> Result<bool, WireError> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(false);
        }
        let header = MessageHeader::from_bytes(&src[..HEADER_SIZE])?;
        let magic = self.deserializer.magic();
        if header.magic != magic {
            return Err(WireError::BadMagic {
                expected: magic,
                actual: header.magic,
            });
        }
        consume(src, &mut self.seen, HEADER_SIZE);

        let length = header.length as u64;
        if let Some((large, batch_size)) = self.deserializer.large_for(&header) {
            log::debug!(
                "Streaming '{}' message of {} bytes in batches of {} bytes",
                header.command,
                length,
                batch_size
            );
            self.deserializer.record_large_started();
            self.state = DecodeState::Large(LargeProgress {
                decoding: large.start(&header, batch_size),
                remaining: length,
                hasher: ChecksumHasher::new(),
                header,
            });
            return Ok(true);
        }

        let max = self.deserializer.config().max_message_size;
        if length > max {
            return Err(WireError::Oversized(length, max));
        }
        self.state = DecodeState::Body(header);
        Ok(true)
    }

    /// Feed buffered body bytes to the streaming deserializer. Returns
    /// `true` once the whole body has been consumed.
    fn stream_body(&mut self, src: &mut BytesMut) -> Result<bool, WireError> {
        let verify = self.deserializer.config().verify_checksum;
        let DecodeState::Large(progress) = &mut self.state else {
            return Ok(true);
        };

        let available = (src.len() as u64).min(progress.remaining) as usize;
        let complete = available as u64 == progress.remaining;
        let mut parts = Vec::new();
        let result = progress
            .decoding
            .feed(&src[..available], complete, &mut parts);

        let used = match result {
            Ok(used) => used,
            Err(e) => {
                self.notify_parts(parts);
                return Err(e);
            }
        };
        progress.hasher.update(&src[..used]);
        progress.remaining -= used as u64;
        consume(src, &mut self.seen, used);

        if progress.remaining > 0 {
            if complete {
                // Everything was available but the deserializer stopped short
                let header = &progress.header;
                let err = WireError::LengthMismatch {
                    command: header.command.clone(),
                    declared: header.length as u64,
                    actual: header.length as u64 - progress.remaining,
                };
                self.notify_parts(parts);
                return Err(err);
            }
            let wanted = progress.remaining.min(STREAM_CHUNK as u64) as usize;
            if src.len() < wanted {
                src.reserve(wanted - src.len());
            }
            self.notify_parts(parts);
            return Ok(false);
        }

        let hasher = std::mem::take(&mut progress.hasher);
        let header = progress.header.clone();
        self.notify_parts(parts);
        if verify && hasher.finalize() != header.checksum {
            return Err(WireError::BadChecksum {
                command: header.command,
            });
        }
        log::trace!("Finished streaming '{}' message", header.command);
        self.deserializer.record_large_completed();
        self.state = DecodeState::Header;
        Ok(true)
    }
}

fn consume(src: &mut BytesMut, seen: &mut usize, n: usize) {
    src.advance(n);
    *seen = seen.saturating_sub(n);
}

impl Decoder for MessageDecoder {
    type Item = BitcoinMsg;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.apply_pre_decode(src);
        loop {
            match &self.state {
                DecodeState::Header => {
                    if !self.read_header(src)? {
                        return Ok(None);
                    }
                }
                DecodeState::Body(header) => {
                    let length = header.length as usize;
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(length);
                    self.seen = self.seen.saturating_sub(length);
                    let DecodeState::Body(header) =
                        std::mem::replace(&mut self.state, DecodeState::Header)
                    else {
                        continue;
                    };
                    let verify = self.deserializer.config().verify_checksum;
                    let msg = BitcoinMsg::from_parts(header, &body, verify)?;
                    self.deserializer.record_decoded();
                    return Ok(Some(msg));
                }
                DecodeState::Large(_) => match self.stream_body(src) {
                    Ok(true) => continue,
                    Ok(false) => return Ok(None),
                    Err(e) => {
                        self.notify_error(&e);
                        self.state = DecodeState::Header;
                        return Err(e.into());
                    }
                },
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() && matches!(self.state, DecodeState::Header) => Ok(None),
            None => {
                let err = WireError::UnexpectedEof("message (connection closed)");
                if self.in_large_message() {
                    self.notify_error(&err);
                    self.state = DecodeState::Header;
                }
                Err(err.into())
            }
        }
    }
}

/// Writes messages in wire format. A message whose header does not match
/// its body is refused with [`StreamError::Encode`] before anything is
/// written.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageEncoder;

impl MessageEncoder {
    /// Check that `msg` can be written
    pub fn check(msg: &BitcoinMsg) -> Result<usize, StreamError> {
        encode_command(&msg.header.command).map_err(StreamError::Encode)?;
        let length = msg.body.encoded_len();
        if length != msg.header.length as usize {
            return Err(StreamError::Encode(WireError::LengthMismatch {
                command: msg.header.command.clone(),
                declared: msg.header.length as u64,
                actual: length as u64,
            }));
        }
        Ok(length)
    }
}

impl Encoder<BitcoinMsg> for MessageEncoder {
    type Error = StreamError;

    fn encode(&mut self, item: BitcoinMsg, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = Self::check(&item)?;
        dst.reserve(HEADER_SIZE + length);
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::large::{CallbackMode, PartialMessage};
    use crate::stream::DeserializerConfig;
    use crate::wire::{Block, BlockHeader, Hash256, Message, Transaction, TxOut};
    use std::sync::Mutex;

    const MAGIC: u32 = 0xE8F3E1E3;

    fn deserializer(threshold: Option<u64>) -> Arc<Deserializer> {
        Arc::new(
            Deserializer::new(DeserializerConfig {
                magic: MAGIC,
                large_msg_threshold: threshold,
                large_msg_batch_size: Some(200),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn block_msg(txs: u8) -> BitcoinMsg {
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: Hash256::ZERO,
                merkle_root: Hash256([1; 32]),
                timestamp: 1,
                bits: 2,
                nonce: 3,
            },
            transactions: (0..txs)
                .map(|i| Transaction {
                    version: 1,
                    inputs: vec![],
                    outputs: vec![TxOut {
                        value: i as i64,
                        script_pubkey: vec![i; 31],
                    }],
                    lock_time: 0,
                })
                .collect(),
        };
        BitcoinMsg::new(MAGIC, Message::Block(block))
    }

    fn recording_notifier() -> (Notifier, Arc<Mutex<Vec<LargeMsgEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let notifier = Notifier::new(CallbackMode::Sync, move |e| sink.lock().unwrap().push(e));
        (notifier, events)
    }

    #[test]
    fn test_decodes_across_partial_reads() {
        let mut decoder = MessageDecoder::new(deserializer(None));
        let ping = BitcoinMsg::new(MAGIC, Message::Ping(11));
        let pong = BitcoinMsg::new(MAGIC, Message::Pong(11));
        let mut bytes = ping.to_bytes();
        bytes.extend(pong.to_bytes());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..10]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[10..30]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[30..]);

        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(ping));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(pong));
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(deserializer_state(&decoder).msgs_decoded, 2);
    }

    fn deserializer_state(decoder: &MessageDecoder) -> crate::stream::DeserializerState {
        decoder.deserializer.state()
    }

    #[test]
    fn test_wrong_magic_is_an_error() {
        let mut decoder = MessageDecoder::new(deserializer(None));
        let mut buf = BytesMut::from(&BitcoinMsg::new(0xDAB5BFFA, Message::VerAck).to_bytes()[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(StreamError::Wire(WireError::BadMagic { .. }))
        ));
    }

    #[test]
    fn test_oversized_body_rejected_at_header() {
        let deserializer = Arc::new(
            Deserializer::new(DeserializerConfig {
                magic: MAGIC,
                max_message_size: 100,
                large_msg_threshold: None,
                ..Default::default()
            })
            .unwrap(),
        );
        let mut decoder = MessageDecoder::new(deserializer);
        let bytes = block_msg(5).to_bytes();
        // Header alone is enough to reject
        let mut buf = BytesMut::from(&bytes[..HEADER_SIZE]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(StreamError::Wire(WireError::Oversized(_, 100)))
        ));
    }

    #[test]
    fn test_large_block_streamed_in_batches() {
        let (notifier, events) = recording_notifier();
        let mut decoder = MessageDecoder::new(deserializer(Some(300))).with_notifier(notifier);
        let block = block_msg(10);
        let ping = BitcoinMsg::new(MAGIC, Message::Ping(5));
        let mut bytes = block.to_bytes();
        bytes.extend(ping.to_bytes());

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(33) {
            buf.extend_from_slice(chunk);
            while let Some(msg) = decoder.decode(&mut buf).unwrap() {
                decoded.push(msg);
            }
        }

        // Only the ping comes out as a whole message
        assert_eq!(decoded, vec![ping]);
        let events = events.lock().unwrap();
        let orders: Vec<(u64, usize)> = events
            .iter()
            .filter_map(|e| match e {
                LargeMsgEvent::Partial(PartialMessage::BlockTxs(b)) => {
                    Some((b.order_number, b.txs.len()))
                }
                _ => None,
            })
            .collect();
        assert!(matches!(
            events[0],
            LargeMsgEvent::Partial(PartialMessage::BlockHeader(_))
        ));
        assert_eq!(orders, vec![(0, 4), (1, 4), (2, 2)]);

        let state = deserializer_state(&decoder);
        assert_eq!(state.large_msgs_started, 1);
        assert_eq!(state.large_msgs_completed, 1);
        assert_eq!(state.partial_msgs_emitted, 4);
    }

    #[test]
    fn test_large_block_bad_checksum_notifies_error() {
        let (notifier, events) = recording_notifier();
        let mut decoder = MessageDecoder::new(deserializer(Some(300))).with_notifier(notifier);
        let mut msg = block_msg(10);
        msg.header.checksum = [0; 4];

        let mut buf = BytesMut::from(&msg.to_bytes()[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(StreamError::Wire(WireError::BadChecksum { .. }))
        ));
        let events = events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(LargeMsgEvent::Error(WireError::BadChecksum { .. }))
        ));
        assert_eq!(deserializer_state(&decoder).large_msgs_failed, 1);
    }

    #[test]
    fn test_eof_inside_message_is_an_error() {
        let mut decoder = MessageDecoder::new(deserializer(None));
        let bytes = BitcoinMsg::new(MAGIC, Message::Ping(1)).to_bytes();
        let mut buf = BytesMut::from(&bytes[..HEADER_SIZE + 3]);
        assert!(decoder.decode_eof(&mut buf).is_err());

        let mut empty = BytesMut::new();
        let mut decoder = MessageDecoder::new(deserializer(None));
        assert!(decoder.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_pre_decode_hook_applied_once() {
        // The hook flips every byte; the wire bytes are sent flipped
        let hook: PreDecodeHook = Arc::new(|bytes: &[u8]| bytes.iter().map(|b| !b).collect());
        let mut decoder = MessageDecoder::new(deserializer(None)).with_pre_decode(hook);
        let ping = BitcoinMsg::new(MAGIC, Message::Ping(77));
        let flipped: Vec<u8> = ping.to_bytes().iter().map(|b| !b).collect();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&flipped[..20]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&flipped[20..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(ping));
    }

    #[test]
    fn test_encoder_writes_wire_bytes() {
        let msg = BitcoinMsg::new(MAGIC, Message::Pong(9));
        let mut dst = BytesMut::new();
        MessageEncoder.encode(msg.clone(), &mut dst).unwrap();
        assert_eq!(&dst[..], &msg.to_bytes()[..]);
    }

    #[test]
    fn test_encoder_refuses_inconsistent_header() {
        let mut msg = BitcoinMsg::new(MAGIC, Message::Pong(9));
        msg.header.length = 3;
        let mut dst = BytesMut::new();
        assert!(matches!(
            MessageEncoder.encode(msg, &mut dst),
            Err(StreamError::Encode(WireError::LengthMismatch { .. }))
        ));
        assert!(dst.is_empty());
    }
}
