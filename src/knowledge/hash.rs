//! Content fingerprints.

use sha2::{Digest, Sha256};

/// SHA-256 of `bytes` as lowercase hex.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_changes_with_content() {
        assert_ne!(content_hash(b"draft 1"), content_hash(b"draft 2"));
        assert_eq!(content_hash(b""), content_hash(&[]));
    }
}
