//! Content-addressed fingerprints for client actions.
//!
//! Two tabs of the same user frequently submit the same action (both saw the
//! same prompt, both clicked). The fingerprint identifies an action by what it
//! does rather than by a message ID, so redundant submissions collide.
//!
//! The timestamp is folded into a coarse bucket. Identical actions that
//! straddle a bucket boundary get different fingerprints; the dedup check then
//! lets the second one through. A rare duplicate is preferred over dropping a
//! distinct action.

use sha2::{Digest, Sha256};
use std::fmt;

/// Field separator inside the hashed material (ASCII unit separator).
const SEP: u8 = 0x1f;

/// Hex characters kept from the digest.
const FINGERPRINT_LEN: usize = 32;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Dedup key derived from `kind`, `action`, `target` and a time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of an action observed at `at_ms`.
    ///
    /// `bucket_ms` is the width of the time bucket; zero is treated as one.
    pub fn compute(kind: &str, action: &str, target: &str, at_ms: i64, bucket_ms: u64) -> Self {
        let width = bucket_ms.max(1).min(i64::MAX as u64) as i64;
        let bucket = at_ms.div_euclid(width);

        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([SEP]);
        hasher.update(action.as_bytes());
        hasher.update([SEP]);
        hasher.update(target.as_bytes());
        hasher.update([SEP]);
        hasher.update(bucket.to_be_bytes());
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(FINGERPRINT_LEN);
        for &byte in digest.iter().take(FINGERPRINT_LEN / 2) {
            hex.push(HEX[usize::from(byte >> 4)] as char);
            hex.push(HEX[usize::from(byte & 0x0f)] as char);
        }
        Self(hex)
    }

    /// Wrap an already computed fingerprint string.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bucket_same_fingerprint() {
        let a = Fingerprint::compute("tool", "approve", "call-1", 10_100, 5_000);
        let b = Fingerprint::compute("tool", "approve", "call-1", 14_999, 5_000);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), FINGERPRINT_LEN);
    }

    #[test]
    fn bucket_boundary_splits() {
        let a = Fingerprint::compute("tool", "approve", "call-1", 14_999, 5_000);
        let b = Fingerprint::compute("tool", "approve", "call-1", 15_000, 5_000);
        assert_ne!(a, b);
    }

    #[test]
    fn fields_do_not_bleed_into_each_other() {
        let a = Fingerprint::compute("ab", "c", "", 0, 1_000);
        let b = Fingerprint::compute("a", "bc", "", 0, 1_000);
        assert_ne!(a, b);
    }

    #[test]
    fn zero_bucket_is_tolerated() {
        let a = Fingerprint::compute("k", "a", "t", 42, 0);
        let b = Fingerprint::compute("k", "a", "t", 42, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn hex_is_lowercase_digest_prefix() {
        let fp = Fingerprint::compute("tool", "approve", "call-1", 0, 1_000);

        let mut hasher = Sha256::new();
        let parts: [&[u8]; 6] = [b"tool", &[SEP], b"approve", &[SEP], b"call-1", &[SEP]];
        for part in parts {
            hasher.update(part);
        }
        hasher.update(0i64.to_be_bytes());
        let expected: String = hasher
            .finalize()
            .iter()
            .take(FINGERPRINT_LEN / 2)
            .map(|b| format!("{b:02x}"))
            .collect();

        assert_eq!(fp.as_str(), expected);
        assert!(fp.as_str().bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f')));
    }
}
