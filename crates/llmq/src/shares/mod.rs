//! Signature share exchange between quorum members
//!
//! Each member of the selected quorum signs the request's sign hash with its
//! key share and sends the share to the other members. Whoever collects
//! `threshold` valid shares first recovers the quorum signature and posts it
//! to the signing coordinator, which gossips it to everyone.

mod exchange;

pub use exchange::{ShareEvent, ShareExchange};

use llmq_core::crypto::Signature;
use llmq_core::{build_sign_hash, Hash32, LlmqType};
use serde::{Deserialize, Serialize};

/// One member's partial signature for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigShare {
    /// Quorum type
    pub llmq_type: LlmqType,
    /// Quorum signing the request
    pub quorum_hash: Hash32,
    /// Signer's position in the quorum
    pub member_index: u16,
    /// Request id
    pub id: Hash32,
    /// Message hash
    pub msg_hash: Hash32,
    /// Signature with the member's key share over the sign hash
    pub sig: Signature,
}

impl SigShare {
    /// Hash the share signs
    pub fn sign_hash(&self) -> Hash32 {
        build_sign_hash(self.llmq_type, &self.quorum_hash, &self.id, &self.msg_hash)
    }
}

/// Progress of share collection for one sign hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Not requested locally; peer shares may be buffered
    Idle,
    /// Own share sent, collecting peer shares
    AwaitingShares,
    /// Threshold reached, recovery in progress
    Recovering,
    /// Signature recovered, here or elsewhere
    Recovered,
    /// Not recovered in time
    Expired,
}

impl RequestState {
    /// Whether collection for the request is over
    pub fn is_finished(self) -> bool {
        matches!(self, RequestState::Recovered | RequestState::Expired)
    }
}
