//! Typed message bodies and the [`BitcoinMsg`] envelope
//!
//! Every body is decoded from, and encoded to, the exact bytes declared
//! by its header. Commands the codec does not model are kept as
//! [`Message::Unknown`] with their raw payload.

use crate::crypto::checksum;
use crate::wire::codec::{
    bounded_capacity, put_var_str, put_varint, ByteReader, Decode, Encode, WireError,
};
use crate::wire::header::{MessageHeader, HEADER_SIZE};
use crate::wire::types::{
    AddrEntry, BlockHeader, Hash256, InvItem, NetAddr, ServiceFlags, Transaction,
    BLOCK_HEADER_SIZE, NET_ADDR_SIZE,
};
use bytes::BufMut;
use std::fmt;

/// Max entries in an `addr` message
pub const MAX_ADDR_ENTRIES: u64 = 1000;

/// Max entries in `inv` / `getdata` / `notfound`
pub const MAX_INV_ENTRIES: u64 = 50_000;

/// Max entries in a `headers` message
pub const MAX_HEADERS: u64 = 2000;

/// Max hashes in a block locator
pub const MAX_LOCATOR_HASHES: u64 = 500;

// Smallest possible transaction: version, two empty counts, lock time
const MIN_TX_SIZE: usize = 10;

/// Message type tag, one per command the codec knows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Version,
    VerAck,
    Ping,
    Pong,
    Addr,
    GetAddr,
    MemPool,
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    GetHeaders,
    Headers,
    Block,
    Tx,
    SendHeaders,
    FeeFilter,
    Reject,
    Unknown,
}

impl MessageType {
    pub const ALL: [MessageType; 18] = [
        MessageType::Version,
        MessageType::VerAck,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Addr,
        MessageType::GetAddr,
        MessageType::MemPool,
        MessageType::Inv,
        MessageType::GetData,
        MessageType::NotFound,
        MessageType::GetBlocks,
        MessageType::GetHeaders,
        MessageType::Headers,
        MessageType::Block,
        MessageType::Tx,
        MessageType::SendHeaders,
        MessageType::FeeFilter,
        MessageType::Reject,
    ];

    /// Wire command string; empty for [`MessageType::Unknown`]
    pub fn command(&self) -> &'static str {
        match self {
            MessageType::Version => "version",
            MessageType::VerAck => "verack",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Addr => "addr",
            MessageType::GetAddr => "getaddr",
            MessageType::MemPool => "mempool",
            MessageType::Inv => "inv",
            MessageType::GetData => "getdata",
            MessageType::NotFound => "notfound",
            MessageType::GetBlocks => "getblocks",
            MessageType::GetHeaders => "getheaders",
            MessageType::Headers => "headers",
            MessageType::Block => "block",
            MessageType::Tx => "tx",
            MessageType::SendHeaders => "sendheaders",
            MessageType::FeeFilter => "feefilter",
            MessageType::Reject => "reject",
            MessageType::Unknown => "",
        }
    }

    pub fn from_command(command: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.command() == command)
            .unwrap_or(MessageType::Unknown)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Unknown => write!(f, "UNKNOWN"),
            other => write!(f, "{}", other.command().to_uppercase()),
        }
    }
}

/// Body of a `version` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// Absent in old protocol versions
    pub relay: Option<bool>,
}

impl Encode for VersionMessage {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services.bits());
        buf.put_i64_le(self.timestamp);
        self.addr_recv.encode(buf);
        self.addr_from.encode(buf);
        buf.put_u64_le(self.nonce);
        put_var_str(buf, &self.user_agent);
        buf.put_i32_le(self.start_height);
        if let Some(relay) = self.relay {
            buf.put_u8(relay as u8);
        }
    }
}

impl Decode for VersionMessage {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let version = reader.read_i32("version: version")?;
        let services = ServiceFlags::from_bits_retain(reader.read_u64("version: services")?);
        let timestamp = reader.read_i64("version: timestamp")?;
        let addr_recv = NetAddr::decode(reader)?;
        let addr_from = NetAddr::decode(reader)?;
        let nonce = reader.read_u64("version: nonce")?;
        let user_agent = reader.read_var_str("version: user_agent")?;
        let start_height = reader.read_i32("version: start_height")?;
        let relay = if reader.is_empty() {
            None
        } else {
            Some(reader.read_u8("version: relay")? != 0)
        };
        Ok(Self {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// Body of `getblocks` / `getheaders`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator {
    pub version: u32,
    pub locator_hashes: Vec<Hash256>,
    pub hash_stop: Hash256,
}

impl Encode for BlockLocator {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.version);
        put_varint(buf, self.locator_hashes.len() as u64);
        for hash in &self.locator_hashes {
            hash.encode(buf);
        }
        self.hash_stop.encode(buf);
    }
}

impl Decode for BlockLocator {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let version = reader.read_u32("locator: version")?;
        let count = reader.read_count("locator hashes", MAX_LOCATOR_HASHES)?;
        let locator_hashes = decode_list(reader, count, 32)?;
        let hash_stop = Hash256::decode(reader)?;
        Ok(Self {
            version,
            locator_hashes,
            hash_stop,
        })
    }
}

/// Body of a `reject` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// Optional extra data, usually the hash of the rejected object
    pub data: Vec<u8>,
}

impl Encode for RejectMessage {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        put_var_str(buf, &self.message);
        buf.put_u8(self.code);
        put_var_str(buf, &self.reason);
        buf.put_slice(&self.data);
    }
}

impl Decode for RejectMessage {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let message = reader.read_var_str("reject: message")?;
        let code = reader.read_u8("reject: code")?;
        let reason = reader.read_var_str("reject: reason")?;
        let rest = reader.remaining();
        let data = reader.read_bytes(rest, "reject: data")?.to_vec();
        Ok(Self {
            message,
            code,
            reason,
            data,
        })
    }
}

/// Body of a `block` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Encode for Block {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        put_varint(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(buf);
        }
    }
}

impl Decode for Block {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let header = BlockHeader::decode(reader)?;
        let count = reader.read_varint("block: tx count")?;
        let transactions = decode_list(reader, count, MIN_TX_SIZE)?;
        Ok(Self {
            header,
            transactions,
        })
    }
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    VerAck,
    Ping(u64),
    Pong(u64),
    Addr(Vec<AddrEntry>),
    GetAddr,
    MemPool,
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetBlocks(BlockLocator),
    GetHeaders(BlockLocator),
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    SendHeaders,
    FeeFilter(u64),
    Reject(RejectMessage),
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Version(_) => MessageType::Version,
            Message::VerAck => MessageType::VerAck,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::Addr(_) => MessageType::Addr,
            Message::GetAddr => MessageType::GetAddr,
            Message::MemPool => MessageType::MemPool,
            Message::Inv(_) => MessageType::Inv,
            Message::GetData(_) => MessageType::GetData,
            Message::NotFound(_) => MessageType::NotFound,
            Message::GetBlocks(_) => MessageType::GetBlocks,
            Message::GetHeaders(_) => MessageType::GetHeaders,
            Message::Headers(_) => MessageType::Headers,
            Message::Block(_) => MessageType::Block,
            Message::Tx(_) => MessageType::Tx,
            Message::SendHeaders => MessageType::SendHeaders,
            Message::FeeFilter(_) => MessageType::FeeFilter,
            Message::Reject(_) => MessageType::Reject,
            Message::Unknown { .. } => MessageType::Unknown,
        }
    }

    /// Command string written in the header
    pub fn command(&self) -> &str {
        match self {
            Message::Unknown { command, .. } => command,
            other => other.message_type().command(),
        }
    }

    /// Decode a body for `command`. The body must be consumed exactly.
    pub fn decode_body(command: &str, body: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(body);
        let message = match MessageType::from_command(command) {
            MessageType::Version => Message::Version(VersionMessage::decode(&mut reader)?),
            MessageType::VerAck => Message::VerAck,
            MessageType::Ping => Message::Ping(reader.read_u64("ping: nonce")?),
            MessageType::Pong => Message::Pong(reader.read_u64("pong: nonce")?),
            MessageType::Addr => {
                let count = reader.read_count("addr entries", MAX_ADDR_ENTRIES)?;
                Message::Addr(decode_list(&mut reader, count, 4 + NET_ADDR_SIZE)?)
            }
            MessageType::GetAddr => Message::GetAddr,
            MessageType::MemPool => Message::MemPool,
            MessageType::Inv => Message::Inv(decode_inv(&mut reader)?),
            MessageType::GetData => Message::GetData(decode_inv(&mut reader)?),
            MessageType::NotFound => Message::NotFound(decode_inv(&mut reader)?),
            MessageType::GetBlocks => Message::GetBlocks(BlockLocator::decode(&mut reader)?),
            MessageType::GetHeaders => Message::GetHeaders(BlockLocator::decode(&mut reader)?),
            MessageType::Headers => {
                let count = reader.read_count("headers", MAX_HEADERS)?;
                let capacity = bounded_capacity(count, reader.remaining(), BLOCK_HEADER_SIZE + 1);
                let mut headers = Vec::with_capacity(capacity);
                for _ in 0..count {
                    headers.push(BlockHeader::decode(&mut reader)?);
                    // Each header is followed by an (always empty) tx count
                    reader.read_varint("headers: tx count")?;
                }
                Message::Headers(headers)
            }
            MessageType::Block => Message::Block(Block::decode(&mut reader)?),
            MessageType::Tx => Message::Tx(Transaction::decode(&mut reader)?),
            MessageType::SendHeaders => Message::SendHeaders,
            MessageType::FeeFilter => Message::FeeFilter(reader.read_u64("feefilter: fee")?),
            MessageType::Reject => Message::Reject(RejectMessage::decode(&mut reader)?),
            MessageType::Unknown => {
                let rest = reader.remaining();
                Message::Unknown {
                    command: command.to_string(),
                    payload: reader.read_bytes(rest, "payload")?.to_vec(),
                }
            }
        };

        if !reader.is_empty() {
            return Err(WireError::LengthMismatch {
                command: command.to_string(),
                declared: body.len() as u64,
                actual: reader.position() as u64,
            });
        }
        Ok(message)
    }

    /// Encoded body bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

impl Encode for Message {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Message::Version(version) => version.encode(buf),
            Message::VerAck | Message::GetAddr | Message::MemPool | Message::SendHeaders => {}
            Message::Ping(nonce) | Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::Addr(entries) => encode_list(buf, entries),
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                encode_list(buf, items)
            }
            Message::GetBlocks(locator) | Message::GetHeaders(locator) => locator.encode(buf),
            Message::Headers(headers) => {
                put_varint(buf, headers.len() as u64);
                for header in headers {
                    header.encode(buf);
                    put_varint(buf, 0);
                }
            }
            Message::Block(block) => block.encode(buf),
            Message::Tx(tx) => tx.encode(buf),
            Message::FeeFilter(fee) => buf.put_u64_le(*fee),
            Message::Reject(reject) => reject.encode(buf),
            Message::Unknown { payload, .. } => buf.put_slice(payload),
        }
    }
}

fn decode_list<T: Decode>(
    reader: &mut ByteReader<'_>,
    count: u64,
    min_size: usize,
) -> Result<Vec<T>, WireError> {
    let mut items = Vec::with_capacity(bounded_capacity(count, reader.remaining(), min_size));
    for _ in 0..count {
        items.push(T::decode(reader)?);
    }
    Ok(items)
}

fn decode_inv(reader: &mut ByteReader<'_>) -> Result<Vec<InvItem>, WireError> {
    let count = reader.read_count("inventory", MAX_INV_ENTRIES)?;
    decode_list(reader, count, 36)
}

fn encode_list<B: BufMut, T: Encode>(buf: &mut B, items: &[T]) {
    put_varint(buf, items.len() as u64);
    for item in items {
        item.encode(buf);
    }
}

/// A message as it travels on the wire: header plus typed body.
///
/// `header.length` always equals the encoded body length and
/// `header.checksum` its checksum when built through [`BitcoinMsg::new`];
/// decoding enforces the same.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitcoinMsg<T = Message> {
    pub header: MessageHeader,
    pub body: T,
}

impl<T> BitcoinMsg<T> {
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }
}

impl BitcoinMsg<Message> {
    /// Wrap `body` in a header for the network identified by `magic`
    pub fn new(magic: u32, body: Message) -> Self {
        let bytes = body.to_bytes();
        let header = MessageHeader::for_body(magic, body.command(), &bytes);
        Self { header, body }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Decode the body that followed `header`, checking length and,
    /// when asked, the checksum
    pub fn from_parts(
        header: MessageHeader,
        body: &[u8],
        verify_checksum: bool,
    ) -> Result<Self, WireError> {
        if body.len() as u64 != header.length as u64 {
            return Err(WireError::LengthMismatch {
                command: header.command.clone(),
                declared: header.length as u64,
                actual: body.len() as u64,
            });
        }
        if verify_checksum && checksum(body) != header.checksum {
            return Err(WireError::BadChecksum {
                command: header.command.clone(),
            });
        }
        let body = Message::decode_body(&header.command, body)?;
        Ok(Self { header, body })
    }

    /// Decode one complete message (header + body) for the given network
    pub fn from_bytes(bytes: &[u8], magic: u32) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(bytes);
        let header = MessageHeader::decode(&mut reader)?;
        if header.magic != magic {
            return Err(WireError::BadMagic {
                expected: magic,
                actual: header.magic,
            });
        }
        let body = reader.read_bytes(header.length as usize, "body")?;
        if !reader.is_empty() {
            return Err(WireError::InvalidData(format!(
                "{} trailing bytes after message",
                reader.remaining()
            )));
        }
        Self::from_parts(header, body, true)
    }

    /// Header followed by body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.header.length as usize);
        self.encode(&mut buf);
        buf
    }
}

impl Encode for BitcoinMsg<Message> {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        self.body.encode(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::types::{InvType, OutPoint, TxIn, TxOut};

    const MAGIC: u32 = 0xE8F3E1E3;

    fn sample_tx(seed: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: OutPoint {
                    hash: Hash256([seed; 32]),
                    index: 0,
                },
                script_sig: vec![seed; 5],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value: 1000 * seed as i64,
                script_pubkey: vec![0xAC],
            }],
            lock_time: 0,
        }
    }

    fn samples() -> Vec<Message> {
        let addr = NetAddr::new("127.0.0.1:8333".parse().unwrap(), ServiceFlags::NODE_NETWORK);
        let header = BlockHeader {
            version: 2,
            prev_block: Hash256([1; 32]),
            merkle_root: Hash256([2; 32]),
            timestamp: 1_600_000_000,
            bits: 0x1808_0000,
            nonce: 42,
        };
        let locator = BlockLocator {
            version: 70015,
            locator_hashes: vec![Hash256([3; 32]), Hash256([4; 32])],
            hash_stop: Hash256::ZERO,
        };
        let inv = vec![InvItem {
            inv_type: InvType::Block,
            hash: Hash256([9; 32]),
        }];
        vec![
            Message::Version(VersionMessage {
                version: 70015,
                services: ServiceFlags::NODE_NETWORK,
                timestamp: 1_700_000_000,
                addr_recv: addr.clone(),
                addr_from: NetAddr::unspecified(),
                nonce: 0xDEAD_BEEF,
                user_agent: "/blockwire:0.1.0/".to_string(),
                start_height: 800_000,
                relay: Some(true),
            }),
            Message::VerAck,
            Message::Ping(7),
            Message::Pong(7),
            Message::Addr(vec![AddrEntry {
                timestamp: 1_700_000_000,
                addr,
            }]),
            Message::GetAddr,
            Message::MemPool,
            Message::Inv(inv.clone()),
            Message::GetData(inv.clone()),
            Message::NotFound(inv),
            Message::GetBlocks(locator.clone()),
            Message::GetHeaders(locator),
            Message::Headers(vec![header.clone(), header.clone()]),
            Message::Block(Block {
                header,
                transactions: vec![sample_tx(1), sample_tx(2)],
            }),
            Message::Tx(sample_tx(3)),
            Message::SendHeaders,
            Message::FeeFilter(1000),
            Message::Reject(RejectMessage {
                message: "tx".to_string(),
                code: 0x10,
                reason: "bad-txns".to_string(),
                data: vec![5; 32],
            }),
            Message::Unknown {
                command: "protoconf".to_string(),
                payload: vec![1, 2, 3],
            },
        ]
    }

    #[test]
    fn test_every_message_type_roundtrips() {
        for message in samples() {
            let msg = BitcoinMsg::new(MAGIC, message.clone());
            let bytes = msg.to_bytes();
            assert_eq!(bytes.len(), HEADER_SIZE + msg.header.length as usize);

            let decoded = BitcoinMsg::from_bytes(&bytes, MAGIC)
                .unwrap_or_else(|e| panic!("{}: {}", message.command(), e));
            assert_eq!(decoded.body, message);
            assert_eq!(decoded.header, msg.header);
        }
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let bytes = BitcoinMsg::new(MAGIC, Message::Ping(1)).to_bytes();
        assert_eq!(
            BitcoinMsg::from_bytes(&bytes, 0xD9B4BEF9),
            Err(WireError::BadMagic {
                expected: 0xD9B4BEF9,
                actual: MAGIC
            })
        );
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut bytes = BitcoinMsg::new(MAGIC, Message::Ping(1)).to_bytes();
        bytes[HEADER_SIZE] ^= 0xFF;
        assert!(matches!(
            BitcoinMsg::from_bytes(&bytes, MAGIC),
            Err(WireError::BadChecksum { .. })
        ));
    }

    #[test]
    fn test_trailing_body_bytes_rejected() {
        let mut body = 5u64.to_le_bytes().to_vec();
        body.push(0);
        let err = Message::decode_body("ping", &body).unwrap_err();
        assert_eq!(
            err,
            WireError::LengthMismatch {
                command: "ping".to_string(),
                declared: 9,
                actual: 8
            }
        );
    }

    #[test]
    fn test_version_without_relay_flag() {
        let mut version = match &samples()[0] {
            Message::Version(v) => v.clone(),
            _ => unreachable!(),
        };
        version.relay = None;
        let body = Message::Version(version.clone()).to_bytes();
        assert_eq!(
            Message::decode_body("version", &body).unwrap(),
            Message::Version(version)
        );
    }

    #[test]
    fn test_addr_limit_enforced() {
        let mut body = Vec::new();
        put_varint(&mut body, MAX_ADDR_ENTRIES + 1);
        assert!(matches!(
            Message::decode_body("addr", &body),
            Err(WireError::TooManyEntries { .. })
        ));
    }

    #[test]
    fn test_message_type_lookup() {
        assert_eq!(MessageType::from_command("block"), MessageType::Block);
        assert_eq!(MessageType::from_command("whatever"), MessageType::Unknown);
        assert_eq!(MessageType::Ping.to_string(), "PING");
    }
}
