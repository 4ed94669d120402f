//! Feldman secret sharing and threshold signature recovery
//!
//! Each DKG participant deals a random polynomial of degree `threshold - 1`
//! and publishes its coefficient commitments (the verification vector).
//! Members are evaluated at a scalar derived from their registration hash.
//! Summing the valid dealers' polynomials gives the quorum polynomial; its
//! constant term's public key is the quorum public key.

use super::bls::{scalar_from_seed, PublicKey, SecretKey, Signature};
use crate::errors::{LlmqError, Result};
use crate::hash::{Hash32, Hasher};
use blstrs::{G1Projective, G2Projective, Scalar};
use ff::Field;
use group::{Curve, Group};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// Evaluation point of a quorum member
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemberId(Scalar);

impl std::fmt::Debug for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemberId({})", hex::encode(&self.0.to_bytes_be()[..6]))
    }
}

/// Evaluation point for a member registration hash
pub fn member_scalar(pro_tx_hash: &Hash32) -> Result<MemberId> {
    scalar_from_seed(pro_tx_hash.as_bytes()).map(MemberId)
}

/// Secret polynomial dealt by one participant
pub struct Polynomial {
    coeffs: Vec<Scalar>,
}

impl Polynomial {
    /// Random polynomial with `threshold` coefficients
    pub fn random(threshold: usize, rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let coeffs = (0..threshold)
            .map(|_| Scalar::random(&mut *rng))
            .collect();
        Self { coeffs }
    }

    /// Evaluate at a member's point
    pub fn evaluate(&self, id: &MemberId) -> SecretKey {
        let mut acc = Scalar::ZERO;
        for c in self.coeffs.iter().rev() {
            acc = acc * id.0 + *c;
        }
        SecretKey(acc)
    }

    /// Public commitments to the coefficients
    pub fn verification_vector(&self) -> VerificationVector {
        let g = G1Projective::generator();
        VerificationVector(
            self.coeffs
                .iter()
                .map(|c| PublicKey((g * *c).to_affine()))
                .collect(),
        )
    }
}

impl Drop for Polynomial {
    fn drop(&mut self) {
        for c in &mut self.coeffs {
            *c = Scalar::ZERO;
        }
    }
}

/// Feldman commitments: `vvec[k] = g1 * a_k`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationVector(pub Vec<PublicKey>);

impl VerificationVector {
    /// Degree plus one
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the vector is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The committed public key (constant term)
    pub fn public_key(&self) -> Option<PublicKey> {
        self.0.first().copied()
    }

    /// Public key share of the member at `id`
    pub fn public_share(&self, id: &MemberId) -> Result<PublicKey> {
        if self.0.is_empty() {
            return Err(LlmqError::crypto("empty verification vector"));
        }
        let mut acc = G1Projective::identity();
        for c in self.0.iter().rev() {
            acc = acc * id.0 + c.projective();
        }
        Ok(PublicKey(acc.to_affine()))
    }

    /// Element-wise sum of equally sized vectors
    pub fn aggregate(vvecs: &[&VerificationVector]) -> Result<VerificationVector> {
        let first = vvecs
            .first()
            .ok_or_else(|| LlmqError::crypto("no verification vectors to aggregate"))?;
        let len = first.len();
        if vvecs.iter().any(|v| v.len() != len) {
            return Err(LlmqError::crypto("verification vector length mismatch"));
        }
        let summed = (0..len)
            .map(|k| {
                let sum: G1Projective = vvecs.iter().map(|v| v.0[k].projective()).sum();
                PublicKey(sum.to_affine())
            })
            .collect();
        Ok(VerificationVector(summed))
    }

    /// Commitment hash carried in the final commitment
    pub fn hash(&self) -> Hash32 {
        let mut h = Hasher::tagged("vvec");
        h.update_u32(self.0.len() as u32);
        for pk in &self.0 {
            h.update(&pk.to_bytes());
        }
        h.finalize()
    }
}

/// Check a dealt secret share against the dealer's verification vector
pub fn verify_secret_share(vvec: &VerificationVector, id: &MemberId, share: &SecretKey) -> bool {
    match vvec.public_share(id) {
        Ok(expected) => share.public_key() == expected,
        Err(_) => false,
    }
}

/// Sum of secret shares received from the valid dealers
pub fn aggregate_secret_shares<'a>(shares: impl IntoIterator<Item = &'a SecretKey>) -> SecretKey {
    SecretKey(shares.into_iter().fold(Scalar::ZERO, |acc, s| acc + *s.scalar()))
}

fn lagrange_at_zero(ids: &[MemberId], i: usize) -> Result<Scalar> {
    let xi = ids[i].0;
    let mut num = Scalar::ONE;
    let mut den = Scalar::ONE;
    for (j, xj) in ids.iter().enumerate() {
        if i == j {
            continue;
        }
        num *= xj.0;
        den *= xj.0 - xi;
    }
    let inv = Option::<Scalar>::from(den.invert())
        .ok_or_else(|| LlmqError::crypto("duplicate member id in recovery set"))?;
    Ok(num * inv)
}

/// Recover the quorum signature from `threshold` signature shares.
///
/// Extra shares beyond `threshold` are ignored. The caller verifies the
/// result against the quorum public key.
pub fn recover_signature(shares: &[(MemberId, Signature)], threshold: usize) -> Result<Signature> {
    if threshold == 0 || shares.len() < threshold {
        return Err(LlmqError::crypto(format!(
            "need {threshold} signature shares, have {}",
            shares.len()
        )));
    }
    let used = &shares[..threshold];
    let ids: Vec<MemberId> = used.iter().map(|(id, _)| *id).collect();
    let mut acc = G2Projective::identity();
    for (i, (_, sig)) in used.iter().enumerate() {
        acc += sig.projective() * lagrange_at_zero(&ids, i)?;
    }
    Ok(Signature(acc.to_affine()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256d;

    fn ids(n: u8) -> Vec<MemberId> {
        (0..n)
            .map(|i| member_scalar(&sha256d(&[i])).unwrap())
            .collect()
    }

    #[test]
    fn test_share_verifies_against_vvec() {
        let mut rng = rand::thread_rng();
        let poly = Polynomial::random(3, &mut rng);
        let vvec = poly.verification_vector();
        let ids = ids(5);
        for id in &ids {
            assert!(verify_secret_share(&vvec, id, &poly.evaluate(id)));
        }
        let wrong = poly.evaluate(&ids[0]);
        assert!(!verify_secret_share(&vvec, &ids[1], &wrong));
    }

    #[test]
    fn test_recovery_from_any_threshold_subset() {
        let mut rng = rand::thread_rng();
        let threshold = 3;
        let ids = ids(5);
        let dealers: Vec<Polynomial> = (0..5).map(|_| Polynomial::random(threshold, &mut rng)).collect();
        let vvecs: Vec<VerificationVector> = dealers.iter().map(Polynomial::verification_vector).collect();
        let quorum_vvec = VerificationVector::aggregate(&vvecs.iter().collect::<Vec<_>>()).unwrap();
        let quorum_pk = quorum_vvec.public_key().unwrap();

        let member_keys: Vec<SecretKey> = ids
            .iter()
            .map(|id| {
                let dealt: Vec<SecretKey> = dealers.iter().map(|d| d.evaluate(id)).collect();
                aggregate_secret_shares(&dealt)
            })
            .collect();
        for (id, sk) in ids.iter().zip(&member_keys) {
            assert_eq!(quorum_vvec.public_share(id).unwrap(), sk.public_key());
        }

        let msg = sha256d(b"sign hash");
        let shares: Vec<(MemberId, Signature)> = ids
            .iter()
            .zip(&member_keys)
            .map(|(id, sk)| (*id, sk.sign(&msg)))
            .collect();

        let a = recover_signature(&shares[..3], threshold).unwrap();
        let b = recover_signature(&shares[2..], threshold).unwrap();
        assert_eq!(a, b);
        assert!(a.verify(&quorum_pk, &msg));
    }

    proptest::proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(12))]

        #[test]
        fn prop_any_threshold_subset_recovers_quorum_signature(
            picked in proptest::sample::subsequence((0..5usize).collect::<Vec<_>>(), 2..=5),
        ) {
            let mut rng = rand::thread_rng();
            let threshold = 2;
            let ids = ids(5);
            let poly = Polynomial::random(threshold, &mut rng);
            let quorum_pk = poly.verification_vector().public_key().unwrap();
            let msg = sha256d(b"subset");

            let shares: Vec<(MemberId, Signature)> = picked
                .iter()
                .map(|&i| (ids[i], poly.evaluate(&ids[i]).sign(&msg)))
                .collect();
            let sig = recover_signature(&shares, threshold).unwrap();
            proptest::prop_assert!(sig.verify(&quorum_pk, &msg));
        }
    }

    #[test]
    fn test_recovery_needs_threshold() {
        let sk = SecretKey::from_seed(b"x").unwrap();
        let shares = vec![(ids(1)[0], sk.sign(&sha256d(b"m")))];
        assert!(recover_signature(&shares, 2).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let sk = SecretKey::from_seed(b"x").unwrap();
        let id = ids(1)[0];
        let sig = sk.sign(&sha256d(b"m"));
        assert!(recover_signature(&[(id, sig), (id, sig)], 2).is_err());
    }
}
