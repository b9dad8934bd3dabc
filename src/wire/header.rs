//! Message header
//!
//! ```text
//! +------------+--------------+---------------+-------------+
//! | magic (4)  | command (12) | length (4 LE) | checksum (4)|
//! +------------+--------------+---------------+-------------+
//! ```

use crate::crypto::{checksum, CHECKSUM_SIZE};
use crate::wire::codec::{ByteReader, Decode, Encode, WireError};
use bytes::BufMut;

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 24;

/// Size of the null-padded command field
pub const COMMAND_SIZE: usize = 12;

/// Fixed-size header preceding every message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub command: String,
    pub length: u32,
    pub checksum: [u8; CHECKSUM_SIZE],
}

impl MessageHeader {
    /// Header for `body`, with length and checksum computed from it
    pub fn for_body(magic: u32, command: &str, body: &[u8]) -> Self {
        Self {
            magic,
            command: command.to_string(),
            length: body.len() as u32,
            checksum: checksum(body),
        }
    }

    /// Decode a header from exactly [`HEADER_SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Self::decode(&mut ByteReader::new(bytes))
    }
}

/// Null-padded 12 byte command field
pub fn encode_command(command: &str) -> Result<[u8; COMMAND_SIZE], WireError> {
    if command.len() > COMMAND_SIZE || !command.is_ascii() {
        return Err(WireError::InvalidCommand);
    }
    let mut out = [0u8; COMMAND_SIZE];
    out[..command.len()].copy_from_slice(command.as_bytes());
    Ok(out)
}

pub fn decode_command(raw: &[u8; COMMAND_SIZE]) -> Result<String, WireError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
    // Everything after the first null must be padding
    if raw[end..].iter().any(|&b| b != 0) {
        return Err(WireError::InvalidCommand);
    }
    let name = &raw[..end];
    if !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(WireError::InvalidCommand);
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

impl Encode for MessageHeader {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.magic);
        // Truncated to the field width (see encode_command for validation)
        let mut command = [0u8; COMMAND_SIZE];
        let len = self.command.len().min(COMMAND_SIZE);
        command[..len].copy_from_slice(&self.command.as_bytes()[..len]);
        buf.put_slice(&command);
        buf.put_u32_le(self.length);
        buf.put_slice(&self.checksum);
    }

    fn encoded_len(&self) -> usize {
        HEADER_SIZE
    }
}

impl Decode for MessageHeader {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let magic = reader.read_u32("header: magic")?;
        let command = decode_command(&reader.read_array("header: command")?)?;
        let length = reader.read_u32("header: length")?;
        let checksum = reader.read_array("header: checksum")?;
        Ok(Self {
            magic,
            command,
            length,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAINNET_MAGIC: u32 = 0xD9B4BEF9;

    #[test]
    fn test_verack_header_bytes() {
        let header = MessageHeader::for_body(MAINNET_MAGIC, "verack", &[]);
        let mut buf = Vec::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[0..4], &[0xF9, 0xBE, 0xB4, 0xD9]);
        assert_eq!(&buf[4..16], b"verack\0\0\0\0\0\0");
        assert_eq!(&buf[16..20], &[0, 0, 0, 0]);
        assert_eq!(&buf[20..24], &[0x5d, 0xf6, 0xe0, 0xe2]);

        assert_eq!(MessageHeader::from_bytes(&buf).unwrap(), header);
    }

    #[test]
    fn test_command_padding_must_be_null() {
        let mut raw = [0u8; COMMAND_SIZE];
        raw[..4].copy_from_slice(b"ping");
        raw[6] = b'x';
        assert_eq!(decode_command(&raw), Err(WireError::InvalidCommand));
    }

    #[test]
    fn test_command_too_long() {
        assert_eq!(
            encode_command("thiscommandistoolong"),
            Err(WireError::InvalidCommand)
        );
        assert_eq!(&encode_command("tx").unwrap()[..3], b"tx\0");
    }

    #[test]
    fn test_short_header_is_incomplete() {
        let err = MessageHeader::from_bytes(&[0xF9, 0xBE, 0xB4]).unwrap_err();
        assert!(err.is_incomplete());
    }
}
