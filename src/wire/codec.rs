//! Low-level encoding primitives
//!
//! Little-endian integers, the variable-width integer ("varint"),
//! length-prefixed byte strings and the [`Encode`]/[`Decode`] traits
//! every wire type implements.

use bytes::BufMut;
use thiserror::Error;

/// Codec / protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Unexpected end of data while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("Invalid network magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },
    #[error("Checksum mismatch for '{command}' message")]
    BadChecksum { command: String },
    #[error("Declared length {declared} does not match decoded length {actual} for '{command}'")]
    LengthMismatch {
        command: String,
        declared: u64,
        actual: u64,
    },
    #[error("Message too large: {0} bytes (max: {1})")]
    Oversized(u64, u64),
    #[error("Invalid command string")]
    InvalidCommand,
    #[error("Too many entries in {what}: {count} (max: {max})")]
    TooManyEntries {
        what: &'static str,
        count: u64,
        max: u64,
    },
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl WireError {
    /// True when more input would allow the decode to succeed
    pub fn is_incomplete(&self) -> bool {
        matches!(self, WireError::UnexpectedEof(_))
    }
}

/// Types that can be written in wire format
pub trait Encode {
    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Number of bytes [`Encode::encode`] writes
    fn encoded_len(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }
}

/// Types that can be read from wire format
pub trait Decode: Sized {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError>;
}

/// Cursor over a borrowed byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEof(what));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N, what)?);
        Ok(out)
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8, WireError> {
        Ok(self.read_bytes(1, what)?[0])
    }

    pub fn read_u16_be(&mut self, what: &'static str) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.read_array(what)?))
    }

    pub fn read_u32(&mut self, what: &'static str) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_i32(&mut self, what: &'static str) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_u64(&mut self, what: &'static str) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_i64(&mut self, what: &'static str) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.read_array(what)?))
    }

    /// Variable-width integer: values below 0xFD take one byte, otherwise a
    /// marker byte (0xFD / 0xFE / 0xFF) is followed by a 2, 4 or 8 byte value.
    pub fn read_varint(&mut self, what: &'static str) -> Result<u64, WireError> {
        match self.read_u8(what)? {
            0xFD => Ok(u16::from_le_bytes(self.read_array(what)?) as u64),
            0xFE => Ok(self.read_u32(what)? as u64),
            0xFF => self.read_u64(what),
            n => Ok(n as u64),
        }
    }

    /// Varint length followed by that many bytes
    pub fn read_var_bytes(&mut self, what: &'static str) -> Result<Vec<u8>, WireError> {
        let len = self.read_varint(what)?;
        if len > self.remaining() as u64 {
            return Err(WireError::UnexpectedEof(what));
        }
        Ok(self.read_bytes(len as usize, what)?.to_vec())
    }

    pub fn read_var_str(&mut self, what: &'static str) -> Result<String, WireError> {
        let bytes = self.read_var_bytes(what)?;
        String::from_utf8(bytes).map_err(|e| WireError::InvalidData(format!("{}: {}", what, e)))
    }

    /// Varint element count, rejected when above `max`
    pub fn read_count(&mut self, what: &'static str, max: u64) -> Result<u64, WireError> {
        let count = self.read_varint(what)?;
        if count > max {
            return Err(WireError::TooManyEntries { what, count, max });
        }
        Ok(count)
    }
}

/// Capacity to preallocate for `count` elements of at least `min_size`
/// bytes each, bounded by what the remaining input could possibly hold.
pub fn bounded_capacity(count: u64, remaining: usize, min_size: usize) -> usize {
    let possible = remaining / min_size.max(1);
    (count as usize).min(possible)
}

/// Number of bytes `value` takes as a varint
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

pub fn put_varint<B: BufMut>(buf: &mut B, value: u64) {
    match value {
        0..=0xFC => buf.put_u8(value as u8),
        0xFD..=0xFFFF => {
            buf.put_u8(0xFD);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.put_u8(0xFE);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xFF);
            buf.put_u64_le(value);
        }
    }
}

pub fn put_var_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn put_var_str<B: BufMut>(buf: &mut B, s: &str) {
    put_var_bytes(buf, s.as_bytes());
}
