//! BLS keys and signatures over BLS12-381
//!
//! Messages are always 32-byte hashes; they are mapped to G2 with the
//! hash-to-curve suite named by [`SIGNATURE_DST`].

use crate::errors::{LlmqError, Result};
use crate::hash::{sha256, Hash32};
use blstrs::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::prime::PrimeCurveAffine;
use group::{Curve, Group};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroize;

/// Domain separation tag for message hashing
pub const SIGNATURE_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_LLMQ_";

/// Compressed public key length
pub const PUBLIC_KEY_LEN: usize = 48;

/// Compressed signature length
pub const SIGNATURE_LEN: usize = 96;

fn hash_to_g2(msg: &Hash32) -> G2Affine {
    G2Projective::hash_to_curve(msg.as_bytes(), SIGNATURE_DST, &[]).to_affine()
}

pub(crate) fn scalar_from_be(bytes: &[u8; 32]) -> Option<Scalar> {
    Option::<Scalar>::from(Scalar::from_bytes_be(bytes))
}

/// Map arbitrary seed bytes to a nonzero scalar
pub(crate) fn scalar_from_seed(seed: &[u8]) -> Result<Scalar> {
    let mut digest = sha256(seed);
    // Clearing the top two bits keeps the value below the group order.
    digest[0] &= 0x3f;
    let scalar = scalar_from_be(&digest)
        .ok_or_else(|| LlmqError::crypto("seed does not map to a scalar"))?;
    if bool::from(scalar.is_zero()) {
        return Err(LlmqError::crypto("seed maps to the zero scalar"));
    }
    Ok(scalar)
}

/// BLS secret key, also used for secret key shares
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(pub(crate) Scalar);

impl SecretKey {
    /// Fresh random key
    pub fn random(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        loop {
            let s = Scalar::random(&mut *rng);
            if !bool::from(s.is_zero()) {
                return SecretKey(s);
            }
        }
    }

    /// Deterministic key derived from seed bytes
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        scalar_from_seed(seed).map(SecretKey)
    }

    /// Parse big-endian bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let s = scalar_from_be(bytes)
            .ok_or_else(|| LlmqError::crypto("secret key out of range"))?;
        Ok(SecretKey(s))
    }

    /// Big-endian bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes_be()
    }

    /// Matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey((G1Projective::generator() * self.0).to_affine())
    }

    /// Sign a message hash
    pub fn sign(&self, msg: &Hash32) -> Signature {
        let h = G2Projective::from(hash_to_g2(msg));
        Signature((h * self.0).to_affine())
    }

    pub(crate) fn scalar(&self) -> &Scalar {
        &self.0
    }
}

impl Zeroize for SecretKey {
    fn zeroize(&mut self) {
        self.0 = Scalar::ZERO;
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// BLS public key in G1
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub(crate) G1Affine);

impl PublicKey {
    /// Parse a compressed key, rejecting the identity
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| LlmqError::crypto("public key must be 48 bytes"))?;
        let point = Option::<G1Affine>::from(G1Affine::from_compressed(&raw))
            .ok_or_else(|| LlmqError::crypto("invalid public key encoding"))?;
        if bool::from(point.is_identity()) {
            return Err(LlmqError::crypto("identity public key"));
        }
        Ok(PublicKey(point))
    }

    /// Compressed encoding
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0.to_compressed()
    }

    /// Sum of public keys; `None` for an empty input
    pub fn aggregate<'a>(keys: impl IntoIterator<Item = &'a PublicKey>) -> Option<PublicKey> {
        let mut iter = keys.into_iter().peekable();
        iter.peek()?;
        let sum: G1Projective = iter.map(|k| G1Projective::from(k.0)).sum();
        Some(PublicKey(sum.to_affine()))
    }

    pub(crate) fn projective(&self) -> G1Projective {
        G1Projective::from(self.0)
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.to_bytes()[..8]))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
        PublicKey::from_bytes(&buf).map_err(serde::de::Error::custom)
    }
}

/// BLS signature in G2
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub(crate) G2Affine);

impl Signature {
    /// Parse a compressed signature
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; SIGNATURE_LEN] = bytes
            .try_into()
            .map_err(|_| LlmqError::crypto("signature must be 96 bytes"))?;
        let point = Option::<G2Affine>::from(G2Affine::from_compressed(&raw))
            .ok_or_else(|| LlmqError::crypto("invalid signature encoding"))?;
        Ok(Signature(point))
    }

    /// Compressed encoding
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.to_compressed()
    }

    /// Verify against a single public key
    pub fn verify(&self, pk: &PublicKey, msg: &Hash32) -> bool {
        let lhs = pairing(&G1Projective::generator().to_affine(), &self.0);
        let rhs = pairing(&pk.0, &hash_to_g2(msg));
        lhs == rhs
    }

    /// Verify an aggregate where every signer signed the same message
    pub fn verify_same_message(&self, pks: &[PublicKey], msg: &Hash32) -> bool {
        match PublicKey::aggregate(pks) {
            Some(agg) => self.verify(&agg, msg),
            None => false,
        }
    }

    /// Sum of signatures; `None` for an empty input
    pub fn aggregate<'a>(sigs: impl IntoIterator<Item = &'a Signature>) -> Option<Signature> {
        let mut iter = sigs.into_iter().peekable();
        iter.peek()?;
        let sum: G2Projective = iter.map(|s| G2Projective::from(s.0)).sum();
        Some(Signature(sum.to_affine()))
    }

    pub(crate) fn projective(&self) -> G2Projective {
        G2Projective::from(self.0)
    }
}

impl std::hash::Hash for Signature {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.to_bytes()[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Signature::from_bytes(&buf).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256d;

    #[test]
    fn test_sign_verify() {
        let sk = SecretKey::random(&mut rand::thread_rng());
        let pk = sk.public_key();
        let msg = sha256d(b"chain lock");
        let sig = sk.sign(&msg);
        assert!(sig.verify(&pk, &msg));
        assert!(!sig.verify(&pk, &sha256d(b"other")));
    }

    #[test]
    fn test_same_message_aggregate() {
        let keys: Vec<SecretKey> = (0u8..4)
            .map(|i| SecretKey::from_seed(&[i]).unwrap())
            .collect();
        let msg = sha256d(b"commitment");
        let sigs: Vec<Signature> = keys.iter().map(|k| k.sign(&msg)).collect();
        let pks: Vec<PublicKey> = keys.iter().map(SecretKey::public_key).collect();
        let agg = Signature::aggregate(&sigs).unwrap();
        assert!(agg.verify_same_message(&pks, &msg));
        assert!(!agg.verify_same_message(&pks[..3], &msg));
    }

    #[test]
    fn test_encoding() {
        let sk = SecretKey::from_seed(b"operator").unwrap();
        let pk = sk.public_key();
        assert_eq!(PublicKey::from_bytes(&pk.to_bytes()).unwrap(), pk);
        assert!(PublicKey::from_bytes(&[0u8; 10]).is_err());
        let sig = sk.sign(&sha256d(b"m"));
        let encoded = bincode::serialize(&sig).unwrap();
        let decoded: Signature = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, sig);
    }
}
