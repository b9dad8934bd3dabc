//! Hashing utilities for the wire protocol
//!
//! Provides the SHA-256 based digests used for message checksums
//! and block/transaction hashes.

use sha2::{Digest, Sha256};

/// Length in bytes of a wire message checksum
pub const CHECKSUM_SIZE: usize = 4;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for block hashes, transaction ids and message checksums
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Computes double SHA-256 hash and returns it as a hex string
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}

/// Message checksum: the first 4 bytes of SHA256(SHA256(body))
pub fn checksum(body: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let digest = double_sha256(body);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Incremental checksum over a body that arrives in pieces.
///
/// Feeding the same bytes through [`ChecksumHasher::update`] in any
/// chunking yields the same result as [`checksum`] on the whole body.
#[derive(Clone, Default)]
pub struct ChecksumHasher {
    inner: Sha256,
}

impl ChecksumHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> [u8; CHECKSUM_SIZE] {
        let first = self.inner.finalize();
        let digest = sha256(&first);
        [digest[0], digest[1], digest[2], digest[3]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        assert_eq!(
            hex::encode(sha256(data)),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_empty_payload_checksum() {
        // Well-known checksum of an empty payload (verack, getaddr, ...)
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_incremental_checksum_matches() {
        let body: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let mut hasher = ChecksumHasher::new();
        for chunk in body.chunks(333) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), checksum(&body));
    }
}
