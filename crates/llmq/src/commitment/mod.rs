//! Final quorum commitments and the ledger of mined commitments
//!
//! A final commitment is the on-chain record of a finished DKG: which
//! members took part validly, which signed the result, the quorum public
//! key and a hash of the quorum verification vector. It carries two
//! signatures over the same commitment hash: the recovered quorum signature
//! (proving `threshold` members hold shares of the key) and the aggregate of
//! the signers' operator signatures.

mod ledger;

pub use ledger::{CommitmentLedger, MinedCommitment};

use crate::interfaces::MasternodeEntry;
use llmq_core::crypto::{PublicKey, Signature};
use llmq_core::{Hash32, Hasher, LlmqError, LlmqParams, LlmqType, MemberSet, Result};
use serde::{Deserialize, Serialize};

/// Finalized DKG result, mined in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalCommitment {
    /// Quorum type
    pub llmq_type: LlmqType,
    /// Hash of the block the quorum is based on
    pub quorum_hash: Hash32,
    /// Index of the quorum within its DKG window
    pub quorum_index: u32,
    /// Members whose premature commitment was aggregated
    pub signers: MemberSet,
    /// Members that completed the DKG validly
    pub valid_members: MemberSet,
    /// Quorum public key; `None` for a null commitment
    pub quorum_public_key: Option<PublicKey>,
    /// Hash of the quorum verification vector
    pub quorum_vvec_hash: Hash32,
    /// Recovered quorum signature over the commitment hash
    pub quorum_sig: Option<Signature>,
    /// Aggregate operator signature of the signers over the commitment hash
    pub members_sig: Option<Signature>,
}

/// Hash signed by commitment signers
pub fn commitment_hash(
    llmq_type: LlmqType,
    quorum_hash: &Hash32,
    valid_members: &MemberSet,
    quorum_public_key: &PublicKey,
    quorum_vvec_hash: &Hash32,
) -> Hash32 {
    let mut h = Hasher::tagged("qcommit");
    h.update(&[llmq_type.as_u8()]).update_hash(quorum_hash);
    h.update_u32(valid_members.len() as u32);
    for bit in valid_members.bits() {
        h.update(&[u8::from(*bit)]);
    }
    h.update(&quorum_public_key.to_bytes())
        .update_hash(quorum_vvec_hash);
    h.finalize()
}

impl FinalCommitment {
    /// Commitment recording that no quorum formed for `quorum_hash`
    pub fn null(llmq_type: LlmqType, quorum_hash: Hash32, quorum_index: u32, size: usize) -> Self {
        Self {
            llmq_type,
            quorum_hash,
            quorum_index,
            signers: MemberSet::new(size),
            valid_members: MemberSet::new(size),
            quorum_public_key: None,
            quorum_vvec_hash: Hash32::ZERO,
            quorum_sig: None,
            members_sig: None,
        }
    }

    /// Whether this records a failed DKG
    pub fn is_null(&self) -> bool {
        self.quorum_public_key.is_none()
            && self.quorum_sig.is_none()
            && self.members_sig.is_none()
            && self.signers.count() == 0
            && self.valid_members.count() == 0
    }

    /// Hash the signatures are over; `None` for a null commitment
    pub fn hash(&self) -> Option<Hash32> {
        self.quorum_public_key.as_ref().map(|pk| {
            commitment_hash(
                self.llmq_type,
                &self.quorum_hash,
                &self.valid_members,
                pk,
                &self.quorum_vvec_hash,
            )
        })
    }

    /// Full validity check against the committee it claims to come from
    pub fn verify(&self, params: &LlmqParams, members: &[MasternodeEntry]) -> Result<()> {
        if self.llmq_type != params.llmq_type {
            return Err(LlmqError::protocol("commitment type mismatch"));
        }
        if members.is_empty() || members.len() > params.size {
            return Err(LlmqError::protocol(format!(
                "committee of {} does not fit quorum size {}",
                members.len(),
                params.size
            )));
        }
        if self.signers.len() != members.len() || self.valid_members.len() != members.len() {
            return Err(LlmqError::protocol("commitment bitset size mismatch"));
        }
        if self.is_null() {
            return Ok(());
        }

        if members.len() < params.min_size {
            return Err(LlmqError::protocol(format!(
                "committee of {} is below the minimum of {}",
                members.len(),
                params.min_size
            )));
        }
        if self.valid_members.count() < params.threshold || self.signers.count() < params.threshold {
            return Err(LlmqError::protocol(format!(
                "commitment has {} valid members and {} signers, need {}",
                self.valid_members.count(),
                self.signers.count(),
                params.threshold
            )));
        }
        let (Some(hash), Some(quorum_pk), Some(quorum_sig), Some(members_sig)) = (
            self.hash(),
            self.quorum_public_key.as_ref(),
            self.quorum_sig.as_ref(),
            self.members_sig.as_ref(),
        ) else {
            return Err(LlmqError::protocol("commitment is partially null"));
        };

        let signer_keys: Vec<PublicKey> = self
            .signers
            .iter_set()
            .map(|i| members[i].operator_public_key)
            .collect();
        if !members_sig.verify_same_message(&signer_keys, &hash) {
            return Err(LlmqError::protocol("invalid commitment members signature"));
        }
        if !quorum_sig.verify(quorum_pk, &hash) {
            return Err(LlmqError::protocol("invalid commitment quorum signature"));
        }
        Ok(())
    }
}
