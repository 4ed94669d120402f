//! BLS threshold capability
//!
//! BLS12-381 in the minimal-public-key configuration: public keys live in
//! G1 (48 bytes compressed), signatures in G2 (96 bytes compressed).
//! Everything the services need goes through this module:
//!
//! - `bls`: keys, signatures, aggregation and verification
//! - `threshold`: Feldman polynomials, verification vectors, share derivation
//!   and Lagrange recovery of threshold signatures
//! - `ies`: authenticated encryption of DKG secret contributions

pub mod bls;
pub mod ies;
pub mod threshold;

pub use bls::{PublicKey, SecretKey, Signature};
pub use ies::EncryptedBlob;
pub use threshold::{
    aggregate_secret_shares, member_scalar, recover_signature, verify_secret_share, MemberId,
    Polynomial, VerificationVector,
};
