//! LLMQ Core - foundation types for the quorum threshold-signing subsystem
//!
//! This crate holds everything the services in `llmq` share but that carries
//! no runtime state of its own.
//!
//! # Contents
//!
//! - `errors`: unified `LlmqError` and `Result` alias
//! - `hash`: `Hash32` identifiers and the double SHA-256 hasher
//! - `types`: LLMQ types, outpoints, transactions, member bitsets
//! - `params`: per-type quorum parameters (`LlmqParams`) and presets
//! - `config`: `LlmqConfig` loaded from TOML and validated up front
//! - `sign_hash`: request ids and the quorum-bound sign hash
//! - `crypto`: the BLS threshold capability (keys, shares, recovery, IES)
//!
//! # Signing model
//!
//! A quorum shares one BLS public key. Each member holds a secret key share
//! derived from a Feldman verification vector; any `threshold` partial
//! signatures over the same sign hash recover, by Lagrange interpolation at
//! zero, the signature of the quorum key. Recovery needs no interaction
//! beyond gossiping shares.

#![forbid(unsafe_code)]

/// Unified error handling
pub mod errors;

/// Hashing and identifiers
pub mod hash;

/// Core value types
pub mod types;

/// Quorum parameters
pub mod params;

/// Subsystem configuration
pub mod config;

/// Request ids and sign hashes
pub mod sign_hash;

/// BLS threshold capability
pub mod crypto;

pub use config::{DkgErrorSimulation, LlmqConfig};
pub use errors::{LlmqError, Result};
pub use hash::{sha256d, Hash32, Hasher};
pub use params::LlmqParams;
pub use sign_hash::{
    build_sign_hash, chain_lock_request_id, instant_lock_request_id, quorum_selection_score,
    upgrade_signal_request_id,
};
pub use types::{BlockHeight, LlmqType, MemberSet, OutPoint, PeerId, ProTxHash, Transaction};
