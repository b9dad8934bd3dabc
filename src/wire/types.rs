//! Wire data types shared by several messages
//!
//! Hashes, network addresses, inventory vectors, block headers and
//! transactions, each with its [`Encode`]/[`Decode`] implementation.

use crate::crypto::double_sha256;
use crate::wire::codec::{
    bounded_capacity, put_var_bytes, put_varint, ByteReader, Decode, Encode, WireError,
};
use bitflags::bitflags;
use bytes::BufMut;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Encoded size of a [`NetAddr`] without timestamp
pub const NET_ADDR_SIZE: usize = 26;

// Smallest possible encodings, used to bound preallocation
const MIN_TX_IN_SIZE: usize = 41;
const MIN_TX_OUT_SIZE: usize = 9;

/// 32-byte double-SHA256 hash, stored in wire (little-endian) order
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Hash of `data` as used for block and transaction ids
    pub fn of(data: &[u8]) -> Self {
        Hash256(double_sha256(data))
    }

    /// Parse the human-readable (byte-reversed) hex form
    pub fn from_hex(s: &str) -> Result<Self, WireError> {
        let bytes = hex::decode(s).map_err(|e| WireError::InvalidData(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(WireError::InvalidData(format!(
                "hash must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        for (i, b) in bytes.iter().rev().enumerate() {
            out[i] = *b;
        }
        Ok(Hash256(out))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self)
    }
}

impl Encode for Hash256 {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.0);
    }

    fn encoded_len(&self) -> usize {
        32
    }
}

impl Decode for Hash256 {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Hash256(reader.read_array("hash")?))
    }
}

bitflags! {
    /// Services advertised by a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    pub struct ServiceFlags: u64 {
        const NODE_NETWORK = 1;
        const NODE_GETUTXO = 1 << 1;
        const NODE_BLOOM = 1 << 2;
        const NODE_NETWORK_LIMITED = 1 << 10;
    }
}

/// Network address as carried in `version` and `addr` messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddr {
    pub services: ServiceFlags,
    /// IPv6, or IPv4-mapped IPv6
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddr {
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    /// Unspecified address, used when the real one is unknown
    pub fn unspecified() -> Self {
        Self::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            ServiceFlags::empty(),
        )
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl Encode for NetAddr {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.services.bits());
        buf.put_slice(&self.ip);
        // Port is the one big-endian field of the protocol
        buf.put_u16(self.port);
    }

    fn encoded_len(&self) -> usize {
        NET_ADDR_SIZE
    }
}

impl Decode for NetAddr {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let services = ServiceFlags::from_bits_retain(reader.read_u64("net_addr: services")?);
        let ip = reader.read_array("net_addr: ip")?;
        let port = reader.read_u16_be("net_addr: port")?;
        Ok(Self { services, ip, port })
    }
}

/// Entry of an `addr` message: a [`NetAddr`] prefixed with a timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrEntry {
    pub timestamp: u32,
    pub addr: NetAddr,
}

impl Encode for AddrEntry {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.timestamp);
        self.addr.encode(buf);
    }

    fn encoded_len(&self) -> usize {
        4 + NET_ADDR_SIZE
    }
}

impl Decode for AddrEntry {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let timestamp = reader.read_u32("addr: timestamp")?;
        let addr = NetAddr::decode(reader)?;
        Ok(Self { timestamp, addr })
    }
}

/// Inventory object type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    CompactBlock,
    Other(u32),
}

impl From<u32> for InvType {
    fn from(value: u32) -> Self {
        match value {
            0 => InvType::Error,
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            4 => InvType::CompactBlock,
            other => InvType::Other(other),
        }
    }
}

impl From<InvType> for u32 {
    fn from(value: InvType) -> Self {
        match value {
            InvType::Error => 0,
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::CompactBlock => 4,
            InvType::Other(other) => other,
        }
    }
}

/// Inventory vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: Hash256,
}

impl Encode for InvItem {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.inv_type.into());
        self.hash.encode(buf);
    }

    fn encoded_len(&self) -> usize {
        36
    }
}

impl Decode for InvItem {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let inv_type = InvType::from(reader.read_u32("inv: type")?);
        let hash = Hash256::decode(reader)?;
        Ok(Self { inv_type, hash })
    }
}

/// 80-byte block header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE);
        self.encode(&mut buf);
        Hash256::of(&buf)
    }
}

impl Encode for BlockHeader {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        self.prev_block.encode(buf);
        self.merkle_root.encode(buf);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
    }

    fn encoded_len(&self) -> usize {
        BLOCK_HEADER_SIZE
    }
}

impl Decode for BlockHeader {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            version: reader.read_i32("block header: version")?,
            prev_block: Hash256::decode(reader)?,
            merkle_root: Hash256::decode(reader)?,
            timestamp: reader.read_u32("block header: timestamp")?,
            bits: reader.read_u32("block header: bits")?,
            nonce: reader.read_u32("block header: nonce")?,
        })
    }
}

/// Reference to a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

/// Transaction as carried in `tx` and `block` messages.
/// Scripts are kept as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        Hash256::of(&buf)
    }
}

impl Encode for Transaction {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        put_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.previous_output.hash.encode(buf);
            buf.put_u32_le(input.previous_output.index);
            put_var_bytes(buf, &input.script_sig);
            buf.put_u32_le(input.sequence);
        }
        put_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.put_i64_le(output.value);
            put_var_bytes(buf, &output.script_pubkey);
        }
        buf.put_u32_le(self.lock_time);
    }
}

impl Decode for Transaction {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let version = reader.read_i32("tx: version")?;

        let num_inputs = reader.read_varint("tx: input count")?;
        let mut inputs = Vec::with_capacity(bounded_capacity(
            num_inputs,
            reader.remaining(),
            MIN_TX_IN_SIZE,
        ));
        for _ in 0..num_inputs {
            let hash = Hash256::decode(reader)?;
            let index = reader.read_u32("tx: outpoint index")?;
            let script_sig = reader.read_var_bytes("tx: script_sig")?;
            let sequence = reader.read_u32("tx: sequence")?;
            inputs.push(TxIn {
                previous_output: OutPoint { hash, index },
                script_sig,
                sequence,
            });
        }

        let num_outputs = reader.read_varint("tx: output count")?;
        let mut outputs = Vec::with_capacity(bounded_capacity(
            num_outputs,
            reader.remaining(),
            MIN_TX_OUT_SIZE,
        ));
        for _ in 0..num_outputs {
            let value = reader.read_i64("tx: value")?;
            let script_pubkey = reader.read_var_bytes("tx: script_pubkey")?;
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }

        let lock_time = reader.read_u32("tx: lock_time")?;

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}
