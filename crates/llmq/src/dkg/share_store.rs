//! Local secret key shares produced by finished DKG sessions

use llmq_core::crypto::{PublicKey, SecretKey, VerificationVector};
use llmq_core::{Hash32, LlmqType, MemberSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// What the local member keeps from a finalized session
#[derive(Debug)]
pub struct LocalKeyShare {
    /// Quorum public key
    pub quorum_public_key: PublicKey,
    /// Quorum verification vector, used to derive member public key shares
    pub vvec: VerificationVector,
    /// Local secret key share
    pub secret_share: SecretKey,
    /// Valid members the share was derived from
    pub valid_members: MemberSet,
}

/// Key shares by quorum. Secret shares are wiped when dropped.
#[derive(Default)]
pub struct KeyShareStore {
    shares: RwLock<HashMap<(LlmqType, Hash32), Arc<LocalKeyShare>>>,
}

impl KeyShareStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the share for a quorum, replacing any previous one
    pub fn insert(&self, llmq_type: LlmqType, quorum_hash: Hash32, share: LocalKeyShare) {
        self.shares
            .write()
            .insert((llmq_type, quorum_hash), Arc::new(share));
    }

    /// Share for a quorum
    pub fn get(&self, llmq_type: LlmqType, quorum_hash: &Hash32) -> Option<Arc<LocalKeyShare>> {
        self.shares.read().get(&(llmq_type, *quorum_hash)).cloned()
    }

    /// Forget the share for a purged quorum
    pub fn remove(&self, llmq_type: LlmqType, quorum_hash: &Hash32) -> bool {
        self.shares
            .write()
            .remove(&(llmq_type, *quorum_hash))
            .is_some()
    }

    /// Number of stored shares
    pub fn len(&self) -> usize {
        self.shares.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.shares.read().is_empty()
    }
}
