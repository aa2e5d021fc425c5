//! Checksum helpers.
//!
//! Chunks and assembled assets are identified by lowercase hex SHA-256.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("{:x}", digest)
}

/// Compare a computed checksum against a caller-supplied one.
pub fn checksums_match(computed: &str, declared: &str) -> bool {
    computed.trim().eq_ignore_ascii_case(declared.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_checksums_match_ignores_case() {
        let sum = sha256_hex(b"chunk");
        assert!(checksums_match(&sum, &sum.to_uppercase()));
        assert!(!checksums_match(&sum, &sha256_hex(b"other")));
    }
}
