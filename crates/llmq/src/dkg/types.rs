//! DKG wire messages

use crate::commitment::commitment_hash;
use llmq_core::crypto::{EncryptedBlob, PublicKey, SecretKey, Signature, VerificationVector};
use llmq_core::{sha256d, Hash32, LlmqType, MemberSet, Result};
use serde::{Deserialize, Serialize};

/// Fields common to every DKG message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgHeader {
    /// Quorum type
    pub llmq_type: LlmqType,
    /// Base block hash of the session
    pub quorum_hash: Hash32,
    /// Sender's position in the committee
    pub member_index: u16,
}

/// Dealer's verification vector and encrypted secret contributions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    /// Sender
    pub header: DkgHeader,
    /// Feldman commitments of the dealer's polynomial
    pub vvec: VerificationVector,
    /// One ciphertext per committee member, in member order
    pub contributions: Vec<EncryptedBlob>,
}

/// Members the sender found faulty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complaint {
    /// Sender
    pub header: DkgHeader,
    /// Members that sent nothing or something malformed
    pub bad_members: MemberSet,
    /// Members whose secret contribution to the sender did not verify
    pub complaints: MemberSet,
}

/// Disputed secret contributions revealed in the clear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Justification {
    /// Sender
    pub header: DkgHeader,
    /// `(recipient index, secret contribution)` per complainer
    pub contributions: Vec<(u16, [u8; 32])>,
}

impl Justification {
    /// Revealed contribution for a recipient
    pub fn contribution_for(&self, recipient: usize) -> Option<SecretKey> {
        self.contributions
            .iter()
            .find(|(i, _)| *i as usize == recipient)
            .and_then(|(_, bytes)| SecretKey::from_bytes(bytes).ok())
    }
}

/// A member's view of the DKG result, signed with its quorum share and operator key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrematureCommitment {
    /// Sender
    pub header: DkgHeader,
    /// Members the sender considers valid
    pub valid_members: MemberSet,
    /// Resulting quorum public key
    pub quorum_public_key: PublicKey,
    /// Hash of the resulting quorum verification vector
    pub quorum_vvec_hash: Hash32,
    /// Signature with the sender's quorum key share
    pub quorum_sig: Signature,
    /// Signature with the sender's operator key
    pub member_sig: Signature,
}

impl PrematureCommitment {
    /// Hash both signatures are over
    pub fn commitment_hash(&self) -> Hash32 {
        commitment_hash(
            self.header.llmq_type,
            &self.header.quorum_hash,
            &self.valid_members,
            &self.quorum_public_key,
            &self.quorum_vvec_hash,
        )
    }
}

/// A message body signed with the sender's operator key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signed<T> {
    /// Message body
    pub body: T,
    /// Operator signature over the body hash
    pub sig: Signature,
}

impl<T: Serialize> Signed<T> {
    /// Hash of the encoded body
    pub fn body_hash(body: &T) -> Result<Hash32> {
        Ok(sha256d(&bincode::serialize(body)?))
    }

    /// Sign a body
    pub fn sign(body: T, operator_key: &SecretKey) -> Result<Self> {
        let sig = operator_key.sign(&Self::body_hash(&body)?);
        Ok(Self { body, sig })
    }

    /// Check the operator signature
    pub fn verify(&self, operator_key: &PublicKey) -> Result<bool> {
        Ok(self.sig.verify(operator_key, &Self::body_hash(&self.body)?))
    }
}

/// DKG protocol traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgMessage {
    /// Contribute phase
    Contribution(Signed<Contribution>),
    /// Complain phase
    Complaint(Signed<Complaint>),
    /// Justify phase
    Justification(Signed<Justification>),
    /// Commit phase; authenticated by its member signature
    PrematureCommitment(PrematureCommitment),
}

impl DkgMessage {
    /// Sender and session
    pub fn header(&self) -> &DkgHeader {
        match self {
            DkgMessage::Contribution(m) => &m.body.header,
            DkgMessage::Complaint(m) => &m.body.header,
            DkgMessage::Justification(m) => &m.body.header,
            DkgMessage::PrematureCommitment(m) => &m.header,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            DkgMessage::Contribution(_) => "qcontrib",
            DkgMessage::Complaint(_) => "qcomplaint",
            DkgMessage::Justification(_) => "qjustify",
            DkgMessage::PrematureCommitment(_) => "qpcommit",
        }
    }

    /// Verify the sender's operator signature
    pub fn verify(&self, operator_key: &PublicKey) -> Result<bool> {
        match self {
            DkgMessage::Contribution(m) => m.verify(operator_key),
            DkgMessage::Complaint(m) => m.verify(operator_key),
            DkgMessage::Justification(m) => m.verify(operator_key),
            DkgMessage::PrematureCommitment(m) => {
                Ok(m.member_sig.verify(operator_key, &m.commitment_hash()))
            }
        }
    }
}
