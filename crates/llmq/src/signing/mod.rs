//! Threshold signing requests and recovered signatures
//!
//! Consumers (chain locks, instant locks, upgrade signals) ask for a quorum
//! signature over `(llmq_type, id, msg_hash)`. The responsible quorum is
//! chosen deterministically, so every node picks the same one. Members hand
//! the request to the share exchange; every node, member or not, learns the
//! recovered signature through gossip and hears about it via listeners.

mod coordinator;

pub use coordinator::{SigningCoordinator, SigningEvent};

use crate::quorums::Quorum;
use llmq_core::crypto::Signature;
use llmq_core::{build_sign_hash, BlockHeight, Hash32, LlmqError, LlmqType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Threshold signature of a quorum over a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecoveredSig {
    /// Quorum type
    pub llmq_type: LlmqType,
    /// Quorum that signed
    pub quorum_hash: Hash32,
    /// Request id
    pub id: Hash32,
    /// Signed message hash
    pub msg_hash: Hash32,
    /// Recovered signature over the sign hash
    pub sig: Signature,
}

impl RecoveredSig {
    /// Hash the quorum signed
    pub fn sign_hash(&self) -> Hash32 {
        build_sign_hash(self.llmq_type, &self.quorum_hash, &self.id, &self.msg_hash)
    }
}

/// Result of looking up a request id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveredLookup {
    /// Nothing recovered yet
    Missing,
    /// One signature recovered
    Recovered(RecoveredSig),
    /// Signatures over different message hashes were recovered for the same id
    Conflicting(Vec<RecoveredSig>),
    /// Our request was not recovered before it expired
    Expired(ExpiredRequest),
}

/// A local signing request that no quorum answered in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredRequest {
    /// Quorum type
    pub llmq_type: LlmqType,
    /// Request id
    pub id: Hash32,
    /// Message hash we asked for
    pub msg_hash: Hash32,
    /// Height the request was made at
    pub requested_at: BlockHeight,
    /// Height the request was given up at
    pub expired_at: BlockHeight,
}

impl ExpiredRequest {
    /// The failure as a `NoQuorum` error
    pub fn to_error(&self) -> LlmqError {
        LlmqError::no_quorum(format!(
            "{} request {} for {} not recovered between heights {} and {}",
            self.llmq_type,
            self.id.short(),
            self.msg_hash.short(),
            self.requested_at,
            self.expired_at
        ))
    }
}

/// A request handed to the share exchange
#[derive(Debug, Clone)]
pub struct SigningRequest {
    /// Request id
    pub id: Hash32,
    /// Message hash to sign
    pub msg_hash: Hash32,
    /// Quorum selected for the request
    pub quorum: Arc<Quorum>,
    /// Height the quorum was selected at
    pub sign_height: BlockHeight,
}

impl SigningRequest {
    /// Hash the quorum signs
    pub fn sign_hash(&self) -> Hash32 {
        build_sign_hash(
            self.quorum.llmq_type(),
            &self.quorum.quorum_hash,
            &self.id,
            &self.msg_hash,
        )
    }
}

/// Subscriber to recovered signatures of one LLMQ type.
///
/// Called from the signing worker thread, once per distinct signature.
pub trait RecoveredSigListener: Send + Sync {
    /// A signature was recovered
    fn on_recovered(&self, sig: &RecoveredSig);

    /// A signature over a different message was recovered for an id that
    /// already had one
    fn on_conflict(&self, _existing: &RecoveredSig, _conflicting: &RecoveredSig) {}

    /// A request made through this node expired without a recovered signature
    fn on_expired(&self, _request: &ExpiredRequest) {}
}

/// Where members send signing requests for share collection
pub trait ShareSink: Send + Sync {
    /// Sign our share and collect the others
    fn start_request(&self, request: SigningRequest);
}
