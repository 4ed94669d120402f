//! Wire messages exchanged between LLMQ nodes

use crate::chainlocks::ChainLockSig;
use crate::commitment::FinalCommitment;
use crate::dkg::DkgMessage;
use crate::instantsend::InstantLock;
use crate::shares::SigShare;
use crate::signing::RecoveredSig;
use llmq_core::Result;
use serde::{Deserialize, Serialize};

/// Every message the subsystem sends or receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmqMessage {
    /// DKG protocol traffic, addressed by quorum hash
    Dkg(DkgMessage),
    /// Final commitment gossip for block assembly
    FinalCommitment(FinalCommitment),
    /// Partial signature for a signing request
    SigShare(SigShare),
    /// Recovered threshold signature
    RecoveredSig(RecoveredSig),
    /// Chain lock
    ChainLock(ChainLockSig),
    /// Instant lock
    InstantLock(InstantLock),
}

impl LlmqMessage {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            LlmqMessage::Dkg(m) => m.kind(),
            LlmqMessage::FinalCommitment(_) => "qfcommit",
            LlmqMessage::SigShare(_) => "qsigshare",
            LlmqMessage::RecoveredSig(_) => "qsigrec",
            LlmqMessage::ChainLock(_) => "clsig",
            LlmqMessage::InstantLock(_) => "islock",
        }
    }

    /// Wire encoding
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse the wire encoding
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
