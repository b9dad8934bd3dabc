//! Cryptographic utilities for the wire protocol
//!
//! This module provides:
//! - SHA-256 / double SHA-256 hashing
//! - Message checksums (one-shot and incremental)

pub mod hash;

pub use hash::{checksum, double_sha256, double_sha256_hex, sha256, ChecksumHasher, CHECKSUM_SIZE};
