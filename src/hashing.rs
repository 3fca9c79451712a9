//! Hashing System - SHA-256 For Template Integrity
//!
//! The resolver (`resolver.rs`) hashes every downloaded template archive
//! before trusting it. Hashing streams the file in fixed-size blocks so a
//! large archive never needs to be held in memory twice.

use sha2::{Digest, Sha256};
use std::io::{self, Read};

const STREAM_BLOCK: usize = 4096;

/// Compute SHA-256 hash of in-memory bytes, return lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute SHA-256 over a reader in 4 KiB blocks, return lowercase hex.
/// Used so the checksum of a downloaded template never requires loading
/// the whole archive into memory at once.
pub fn sha256_hex_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; STREAM_BLOCK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether a string is a well-formed 64-character lowercase hex SHA-256 digest.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
