//! Whole-file integrity: SHA-256 over raw bytes, hex-encoded for the wire.

use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Hash a complete byte buffer (an in-progress reassembled file, or the bytes
/// a sender is about to transmit). Returns lowercase hex, matching the `END`
/// wire field.
pub fn hash_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_hash_is_sha256_of_empty_input() {
        assert_eq!(
            hash_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hash_is_deterministic() {
        let a = hash_hex(b"hello world");
        let b = hash_hex(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn different_data_different_hash() {
        assert_ne!(hash_hex(b"a"), hash_hex(b"b"));
    }
}
