//! Hashing for identifiers and sign hashes
//!
//! All identifiers in the subsystem (quorum hashes, request ids, message
//! hashes, commitment hashes) are 32-byte double SHA-256 digests. Tagged
//! identifiers are built by feeding a domain prefix followed by the
//! fields, so `H("clsig", height)` and `H("islock", inputs)` never collide.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 32-byte digest used for every identifier in the subsystem
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    /// The all-zero hash
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    /// Build from a byte slice, failing on length mismatch
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash32(arr))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the all-zero hash
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Full lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    /// Shortened hex form used in log fields
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.short())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(bytes: [u8; 32]) -> Self {
        Hash32(bytes)
    }
}

/// Incremental double SHA-256 hasher
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    /// Create an empty hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hasher seeded with a domain tag
    pub fn tagged(tag: &str) -> Self {
        let mut h = Self::new();
        h.update_str(tag);
        h
    }

    /// Feed raw bytes
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Feed a length-prefixed string
    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.update_u32(s.len() as u32);
        self.inner.update(s.as_bytes());
        self
    }

    /// Feed a hash
    pub fn update_hash(&mut self, h: &Hash32) -> &mut Self {
        self.inner.update(h.0);
        self
    }

    /// Feed a little-endian u32
    pub fn update_u32(&mut self, v: u32) -> &mut Self {
        self.inner.update(v.to_le_bytes());
        self
    }

    /// Feed a little-endian u64
    pub fn update_u64(&mut self, v: u64) -> &mut Self {
        self.inner.update(v.to_le_bytes());
        self
    }

    /// Finish with a second SHA-256 round
    pub fn finalize(self) -> Hash32 {
        let first = self.inner.finalize();
        Hash32(Sha256::digest(first).into())
    }
}

/// Double SHA-256 of arbitrary bytes
pub fn sha256d(data: &[u8]) -> Hash32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

/// Single SHA-256, used where a plain digest is needed (key derivation input)
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(sha256d(b"llmq"), sha256d(b"llmq"));
        assert_ne!(sha256d(b"llmq"), sha256d(b"llmq2"));
    }

    #[test]
    fn test_tagged_domains_differ() {
        let mut a = Hasher::tagged("clsig");
        a.update_u32(10);
        let mut b = Hasher::tagged("islock");
        b.update_u32(10);
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_hex_roundtrip() {
        let h = sha256d(b"abc");
        assert_eq!(Hash32::from_hex(&h.to_hex()), Some(h));
        assert_eq!(Hash32::from_hex("zz"), None);
    }
}
