//! Instant locks: quorum signatures over a transaction's inputs
//!
//! A lock commits the spent outpoints of one transaction so that no other
//! transaction spending them is accepted. Chain locks take precedence: a
//! chain-locked block that spends a locked input for a different transaction
//! retracts the lock.

mod handler;

pub use handler::{InstantLockEvent, InstantLockHandler};

use llmq_core::crypto::Signature;
use llmq_core::{instant_lock_request_id, Hash32, OutPoint};
use serde::{Deserialize, Serialize};

/// A transaction lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstantLock {
    /// Locked transaction
    pub txid: Hash32,
    /// Outpoints the transaction spends
    pub inputs: Vec<OutPoint>,
    /// Quorum that signed
    pub quorum_hash: Hash32,
    /// Recovered quorum signature
    pub sig: Signature,
}

impl InstantLock {
    /// Signing request id for the lock's inputs
    pub fn request_id(&self) -> Hash32 {
        instant_lock_request_id(&self.inputs)
    }
}
