//! Token minting and hashing.
//!
//! Lease tokens and runner tokens are random secrets minted on the control
//! plane; only their SHA-256 digests are persisted. The raw token crosses the
//! wire exactly once.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Mint a fresh random token.
pub fn mint() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Hex SHA-256 digest of a raw token, as stored in the database.
pub fn hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex_lower(&digest)
}

fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex() {
        let h = hash("minitower");
        assert_eq!(h, hash("minitower"));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn minted_tokens_are_unique() {
        assert_ne!(mint(), mint());
    }
}
