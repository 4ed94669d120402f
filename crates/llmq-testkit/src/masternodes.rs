//! Deterministic masternode lists

use llmq::{LocalMasternode, MasternodeEntry, MasternodeList};
use llmq_core::crypto::SecretKey;
use llmq_core::{sha256d, Hash32, Hasher, LlmqParams, PeerId};

/// A registered masternode with its operator key
#[derive(Debug, Clone)]
pub struct TestMasternode {
    /// Public registration
    pub entry: MasternodeEntry,
    /// Operator secret key
    pub operator_key: SecretKey,
}

impl TestMasternode {
    /// Deterministic masternode number `index`, reachable at `peer`
    pub fn generate(index: usize, peer: PeerId) -> Self {
        let operator_key = SecretKey::from_seed(format!("operator-{index}").as_bytes())
            .expect("seeded key derivation");
        Self {
            entry: MasternodeEntry {
                pro_tx_hash: sha256d(format!("protx-{index}").as_bytes()),
                operator_public_key: operator_key.public_key(),
                peer,
            },
            operator_key,
        }
    }

    /// Identity to hand to the node's context
    pub fn local(&self) -> LocalMasternode {
        LocalMasternode {
            pro_tx_hash: self.entry.pro_tx_hash,
            operator_key: self.operator_key.clone(),
        }
    }
}

/// Committees are the `size` lowest-scoring masternodes for the quorum hash
#[derive(Debug, Clone, Default)]
pub struct TestMasternodeList {
    nodes: Vec<TestMasternode>,
}

impl TestMasternodeList {
    /// `count` masternodes on peers `1..=count`
    pub fn generate(count: usize) -> Self {
        Self {
            nodes: (0..count)
                .map(|i| TestMasternode::generate(i, PeerId(i as u64 + 1)))
                .collect(),
        }
    }

    /// Masternode by index
    pub fn get(&self, index: usize) -> &TestMasternode {
        &self.nodes[index]
    }

    /// Number of registered masternodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn score(quorum_hash: &Hash32, pro_tx_hash: &Hash32) -> Hash32 {
        let mut h = Hasher::tagged("test-quorum-member");
        h.update_hash(quorum_hash).update_hash(pro_tx_hash);
        h.finalize()
    }
}

impl MasternodeList for TestMasternodeList {
    fn quorum_members(&self, params: &LlmqParams, quorum_hash: &Hash32) -> Vec<MasternodeEntry> {
        let mut entries: Vec<MasternodeEntry> = self.nodes.iter().map(|n| n.entry.clone()).collect();
        entries.sort_by_key(|e| Self::score(quorum_hash, &e.pro_tx_hash));
        entries.truncate(params.size);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_params;

    #[test]
    fn test_committee_is_deterministic_per_quorum() {
        let list = TestMasternodeList::generate(6);
        let params = test_params();
        let a = list.quorum_members(&params, &sha256d(b"a"));
        assert_eq!(a.len(), params.size);
        assert_eq!(a, list.quorum_members(&params, &sha256d(b"a")));
        assert_eq!(
            TestMasternode::generate(2, PeerId(3)).entry,
            list.get(2).entry
        );
    }
}
