//! Integrated encryption of DKG secret contributions
//!
//! Ephemeral BLS key agreement in G1, HKDF-SHA256 key derivation and
//! ChaCha20-Poly1305. The associated data binds a blob to its session,
//! dealer and recipient so it cannot be replayed elsewhere.

use super::bls::{PublicKey, SecretKey};
use crate::errors::{LlmqError, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use group::Curve;
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

const KDF_INFO: &[u8] = b"llmq-dkg-contribution";

/// Ciphertext addressed to one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    /// Sender's ephemeral public key
    pub ephemeral: PublicKey,
    /// AEAD nonce
    pub nonce: [u8; 12],
    /// Ciphertext with tag
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

fn derive_key(ephemeral: &PublicKey, shared: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(&ephemeral.to_bytes()), shared);
    let mut okm = [0u8; 32];
    hk.expand(KDF_INFO, &mut okm)
        .map_err(|_| LlmqError::crypto("hkdf expand failed"))?;
    Ok(okm)
}

fn shared_secret(point: &PublicKey, scalar: &SecretKey) -> [u8; 48] {
    (point.projective() * *scalar.scalar()).to_affine().to_compressed()
}

/// Encrypt `plaintext` to `recipient`
pub fn encrypt(
    recipient: &PublicKey,
    plaintext: &[u8],
    aad: &[u8],
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<EncryptedBlob> {
    let eph = SecretKey::random(&mut *rng);
    let ephemeral = eph.public_key();
    let mut shared = shared_secret(recipient, &eph);
    let mut key = derive_key(&ephemeral, &shared)?;
    shared.zeroize();

    let mut nonce = [0u8; 12];
    rng.fill_bytes(&mut nonce);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| LlmqError::crypto("contribution encryption failed"))?;
    Ok(EncryptedBlob {
        ephemeral,
        nonce,
        ciphertext,
    })
}

/// Decrypt a blob with the recipient's secret key
pub fn decrypt(recipient: &SecretKey, blob: &EncryptedBlob, aad: &[u8]) -> Result<Vec<u8>> {
    let mut shared = shared_secret(&blob.ephemeral, recipient);
    let mut key = derive_key(&blob.ephemeral, &shared)?;
    shared.zeroize();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    cipher
        .decrypt(
            Nonce::from_slice(&blob.nonce),
            Payload {
                msg: &blob.ciphertext,
                aad,
            },
        )
        .map_err(|_| LlmqError::crypto("contribution decryption failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let mut rng = rand::thread_rng();
        let sk = SecretKey::random(&mut rng);
        let blob = encrypt(&sk.public_key(), b"share bytes", b"session", &mut rng).unwrap();
        assert_eq!(decrypt(&sk, &blob, b"session").unwrap(), b"share bytes");
    }

    #[test]
    fn test_wrong_key_or_aad_fails() {
        let mut rng = rand::thread_rng();
        let sk = SecretKey::random(&mut rng);
        let other = SecretKey::random(&mut rng);
        let blob = encrypt(&sk.public_key(), b"share bytes", b"session", &mut rng).unwrap();
        assert!(decrypt(&other, &blob, b"session").is_err());
        assert!(decrypt(&sk, &blob, b"other session").is_err());
    }
}
