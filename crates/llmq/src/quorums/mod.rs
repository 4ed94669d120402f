//! Active quorums built from mined commitments

mod registry;

pub use registry::QuorumRegistry;

use crate::commitment::MinedCommitment;
use crate::dkg::LocalKeyShare;
use crate::interfaces::MasternodeEntry;
use llmq_core::crypto::{member_scalar, MemberId, PublicKey, SecretKey, VerificationVector};
use llmq_core::{BlockHeight, Hash32, LlmqError, LlmqParams, LlmqType, MemberSet, ProTxHash, Result};
use std::sync::Arc;

/// A formed quorum. Immutable; the registry replaces the whole value when
/// a local key share becomes available.
#[derive(Debug)]
pub struct Quorum {
    /// Parameters of the quorum's type
    pub params: LlmqParams,
    /// Base block hash
    pub quorum_hash: Hash32,
    /// Index within the DKG window
    pub quorum_index: u32,
    /// Base block height
    pub base_height: BlockHeight,
    /// Height the commitment was mined at
    pub mined_height: BlockHeight,
    /// Committee, in member order
    pub members: Vec<MasternodeEntry>,
    /// Members that completed the DKG validly
    pub valid_members: MemberSet,
    /// Quorum public key
    pub public_key: PublicKey,
    member_ids: Vec<MemberId>,
    key_share: Option<Arc<LocalKeyShare>>,
    public_shares: Vec<Option<PublicKey>>,
}

fn derive_public_shares(
    member_ids: &[MemberId],
    valid_members: &MemberSet,
    key_share: Option<&LocalKeyShare>,
) -> Vec<Option<PublicKey>> {
    member_ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let share = key_share.filter(|_| valid_members.get(i))?;
            share.vvec.public_share(id).ok()
        })
        .collect()
}

impl Quorum {
    /// Build from a non-null mined commitment and its committee
    pub fn from_commitment(
        params: LlmqParams,
        mined: &MinedCommitment,
        members: Vec<MasternodeEntry>,
        key_share: Option<Arc<LocalKeyShare>>,
    ) -> Result<Self> {
        let c = &mined.commitment;
        let public_key = c
            .quorum_public_key
            .ok_or_else(|| LlmqError::invalid("null commitment does not form a quorum"))?;
        let member_ids = members
            .iter()
            .map(|m| member_scalar(&m.pro_tx_hash))
            .collect::<Result<Vec<_>>>()?;

        let key_share = key_share.filter(|s| s.quorum_public_key == public_key);
        let public_shares = derive_public_shares(&member_ids, &c.valid_members, key_share.as_deref());

        Ok(Self {
            params,
            quorum_hash: c.quorum_hash,
            quorum_index: c.quorum_index,
            base_height: mined.base_height,
            mined_height: mined.mined_height,
            members,
            valid_members: c.valid_members.clone(),
            public_key,
            member_ids,
            key_share,
            public_shares,
        })
    }

    /// Same quorum with the local key share attached; `None` if the share
    /// belongs to a different quorum key
    pub fn with_key_share(&self, key_share: Arc<LocalKeyShare>) -> Option<Quorum> {
        if key_share.quorum_public_key != self.public_key {
            return None;
        }
        Some(Self {
            params: self.params.clone(),
            quorum_hash: self.quorum_hash,
            quorum_index: self.quorum_index,
            base_height: self.base_height,
            mined_height: self.mined_height,
            members: self.members.clone(),
            valid_members: self.valid_members.clone(),
            public_key: self.public_key,
            public_shares: derive_public_shares(
                &self.member_ids,
                &self.valid_members,
                Some(&*key_share),
            ),
            member_ids: self.member_ids.clone(),
            key_share: Some(key_share),
        })
    }

    /// Quorum type
    pub fn llmq_type(&self) -> LlmqType {
        self.params.llmq_type
    }

    /// Shares needed for recovery
    pub fn threshold(&self) -> usize {
        self.params.threshold
    }

    /// Position of a masternode in the committee
    pub fn member_index(&self, pro_tx_hash: &ProTxHash) -> Option<usize> {
        self.members.iter().position(|m| &m.pro_tx_hash == pro_tx_hash)
    }

    /// Whether a masternode is a valid member
    pub fn is_valid_member(&self, pro_tx_hash: &ProTxHash) -> bool {
        self.member_index(pro_tx_hash)
            .is_some_and(|i| self.valid_members.get(i))
    }

    /// Evaluation point of member `index`
    pub fn member_id(&self, index: usize) -> Option<MemberId> {
        self.member_ids.get(index).copied()
    }

    /// Public key share of a valid member; needs the verification vector
    pub fn public_share(&self, index: usize) -> Option<PublicKey> {
        self.public_shares.get(index).copied().flatten()
    }

    /// Local secret key share, when we are a valid member
    pub fn secret_share(&self) -> Option<&SecretKey> {
        self.key_share.as_ref().map(|s| &s.secret_share)
    }

    /// Quorum verification vector, when known locally
    pub fn vvec(&self) -> Option<&VerificationVector> {
        self.key_share.as_ref().map(|s| &s.vvec)
    }

    /// Whether this node can sign for the quorum
    pub fn can_sign(&self) -> bool {
        self.key_share.is_some()
    }
}
