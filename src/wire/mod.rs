//! Wire message codec
//!
//! Pure encode/decode functions for the binary P2P protocol:
//! - 24-byte message header (magic, command, length, checksum)
//! - varint / var_bytes primitives
//! - typed message bodies wrapped in [`BitcoinMsg`]
//!
//! All integers are little-endian except the port of a network address.

pub mod codec;
pub mod header;
pub mod message;
pub mod types;

pub use codec::{
    put_var_bytes, put_var_str, put_varint, varint_size, ByteReader, Decode, Encode, WireError,
};
pub use header::{MessageHeader, COMMAND_SIZE, HEADER_SIZE};
pub use message::{
    BitcoinMsg, Block, BlockLocator, Message, MessageType, RejectMessage, VersionMessage,
    MAX_ADDR_ENTRIES, MAX_HEADERS, MAX_INV_ENTRIES,
};
pub use types::{
    AddrEntry, BlockHeader, Hash256, InvItem, InvType, NetAddr, OutPoint, ServiceFlags,
    Transaction, TxIn, TxOut, BLOCK_HEADER_SIZE,
};
