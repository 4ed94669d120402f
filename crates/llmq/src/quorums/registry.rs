//! Rolling set of formed quorums per type

use super::Quorum;
use crate::commitment::MinedCommitment;
use crate::dkg::KeyShareStore;
use crate::interfaces::MasternodeList;
use llmq_core::{
    quorum_selection_score, BlockHeight, Hash32, LlmqConfig, LlmqError, LlmqType, Result,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

type QuorumKey = (LlmqType, Hash32);

#[derive(Default)]
struct RegistryState {
    quorums: HashMap<QuorumKey, Arc<Quorum>>,
    purged: HashSet<QuorumKey>,
    tip: BlockHeight,
}

/// Quorums formed from mined commitments, with the local key shares attached
pub struct QuorumRegistry {
    config: Arc<LlmqConfig>,
    masternodes: Arc<dyn MasternodeList>,
    key_shares: Arc<KeyShareStore>,
    state: RwLock<RegistryState>,
}

impl QuorumRegistry {
    /// Create an empty registry
    pub fn new(
        config: Arc<LlmqConfig>,
        masternodes: Arc<dyn MasternodeList>,
        key_shares: Arc<KeyShareStore>,
    ) -> Self {
        Self {
            config,
            masternodes,
            key_shares,
            state: RwLock::new(RegistryState::default()),
        }
    }

    fn build(&self, mined: &MinedCommitment) -> Result<Quorum> {
        let c = &mined.commitment;
        let params = self.config.require_params(c.llmq_type)?;
        let members = self.masternodes.quorum_members(params, &c.quorum_hash);
        let share = self.key_shares.get(c.llmq_type, &c.quorum_hash);
        Quorum::from_commitment(params.clone(), mined, members, share)
    }

    /// Ingest the commitments mined in a newly connected block
    pub fn block_connected(&self, height: BlockHeight, mined: &[MinedCommitment]) {
        let mut built = Vec::new();
        for m in mined.iter().filter(|m| !m.commitment.is_null()) {
            match self.build(m) {
                Ok(q) => built.push(q),
                Err(e) => warn!(
                    quorum_hash = %m.commitment.quorum_hash.short(),
                    error = %e,
                    "cannot build quorum"
                ),
            }
        }

        let mut state = self.state.write();
        state.tip = height;
        for q in built {
            info!(
                llmq_type = %q.llmq_type(),
                quorum_hash = %q.quorum_hash.short(),
                valid = q.valid_members.count(),
                local_share = q.can_sign(),
                "quorum formed"
            );
            let key = (q.llmq_type(), q.quorum_hash);
            state.purged.remove(&key);
            state.quorums.insert(key, Arc::new(q));
        }
        self.evict(&mut state);
    }

    /// Drop quorums whose commitments were unmined by a disconnected block
    pub fn block_disconnected(&self, height: BlockHeight, unmined: &[MinedCommitment]) {
        let mut state = self.state.write();
        state.tip = height.saturating_sub(1);
        for m in unmined {
            if state
                .quorums
                .remove(&(m.commitment.llmq_type, m.commitment.quorum_hash))
                .is_some()
            {
                debug!(quorum_hash = %m.commitment.quorum_hash.short(), "quorum disconnected");
            }
        }
    }

    /// Keep the `keep_old_quorums` most recent quorums per type
    fn evict(&self, state: &mut RegistryState) {
        for params in &self.config.params {
            let mut of_type: Vec<(BlockHeight, Hash32)> = state
                .quorums
                .values()
                .filter(|q| q.llmq_type() == params.llmq_type)
                .map(|q| (q.base_height, q.quorum_hash))
                .collect();
            if of_type.len() <= params.keep_old_quorums {
                continue;
            }
            of_type.sort_by(|a, b| b.cmp(a));
            for (_, hash) in of_type.split_off(params.keep_old_quorums) {
                let key = (params.llmq_type, hash);
                state.quorums.remove(&key);
                state.purged.insert(key);
                self.key_shares.remove(params.llmq_type, &hash);
                debug!(llmq_type = %params.llmq_type, quorum_hash = %hash.short(), "quorum purged");
            }
        }
    }

    /// A DKG session stored a key share; attach it if the quorum is already known
    pub fn on_local_share(&self, llmq_type: LlmqType, quorum_hash: &Hash32) {
        let key = (llmq_type, *quorum_hash);
        let Some(existing) = self.state.read().quorums.get(&key).cloned() else {
            return;
        };
        if existing.can_sign() {
            return;
        }
        let Some(share) = self.key_shares.get(llmq_type, quorum_hash) else {
            return;
        };
        match existing.with_key_share(share) {
            Some(q) => {
                debug!(quorum_hash = %quorum_hash.short(), "key share attached");
                self.state.write().quorums.insert(key, Arc::new(q));
            }
            None => warn!(
                quorum_hash = %quorum_hash.short(),
                "local key share does not match the mined quorum key"
            ),
        }
    }

    /// Quorum by base block hash
    pub fn lookup(&self, llmq_type: LlmqType, quorum_hash: &Hash32) -> Option<Arc<Quorum>> {
        self.state.read().quorums.get(&(llmq_type, *quorum_hash)).cloned()
    }

    /// Quorum that may still be used for signing or verification
    pub fn require_active(&self, llmq_type: LlmqType, quorum_hash: &Hash32) -> Result<Arc<Quorum>> {
        let state = self.state.read();
        let key = (llmq_type, *quorum_hash);
        if let Some(q) = state.quorums.get(&key) {
            return Ok(Arc::clone(q));
        }
        if state.purged.contains(&key) {
            return Err(LlmqError::quorum_expired(format!(
                "{llmq_type} quorum {} was purged",
                quorum_hash.short()
            )));
        }
        Err(LlmqError::not_found(format!(
            "{llmq_type} quorum {} is unknown",
            quorum_hash.short()
        )))
    }

    /// Signing quorums at the current tip
    pub fn active_quorums(&self, llmq_type: LlmqType) -> Vec<Arc<Quorum>> {
        let tip = self.state.read().tip;
        self.active_quorums_at(llmq_type, tip)
    }

    /// Signing quorums as of `height`: the most recent mined at or below
    /// `height`, at most `signing_active_quorum_count` of them
    pub fn active_quorums_at(&self, llmq_type: LlmqType, height: BlockHeight) -> Vec<Arc<Quorum>> {
        let Some(params) = self.config.params_for(llmq_type) else {
            return Vec::new();
        };
        let state = self.state.read();
        let mut out: Vec<Arc<Quorum>> = state
            .quorums
            .values()
            .filter(|q| q.llmq_type() == llmq_type && q.mined_height <= height)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.base_height
                .cmp(&a.base_height)
                .then(b.quorum_index.cmp(&a.quorum_index))
        });
        out.truncate(params.signing_active_quorum_count);
        out
    }

    /// Quorum responsible for request `id` at `sign_height`
    pub fn select_quorum_for_signing(
        &self,
        llmq_type: LlmqType,
        id: &Hash32,
        sign_height: BlockHeight,
    ) -> Option<Arc<Quorum>> {
        let height = sign_height.saturating_sub(self.config.sign_height_offset);
        self.active_quorums_at(llmq_type, height)
            .into_iter()
            .min_by_key(|q| quorum_selection_score(llmq_type, &q.quorum_hash, id))
    }

    /// Current tip as seen by the registry
    pub fn tip(&self) -> BlockHeight {
        self.state.read().tip
    }

    /// Number of retained quorums of a type
    pub fn quorum_count(&self, llmq_type: LlmqType) -> usize {
        self.state
            .read()
            .quorums
            .keys()
            .filter(|(t, _)| *t == llmq_type)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::FinalCommitment;
    use crate::interfaces::MasternodeEntry;
    use assert_matches::assert_matches;
    use llmq_core::crypto::SecretKey;
    use llmq_core::{sha256d, LlmqParams, MemberSet, PeerId};

    struct FixedMembers(Vec<MasternodeEntry>);

    impl MasternodeList for FixedMembers {
        fn quorum_members(&self, _: &LlmqParams, _: &Hash32) -> Vec<MasternodeEntry> {
            self.0.clone()
        }
    }

    fn registry() -> QuorumRegistry {
        let members = (0..3u8)
            .map(|i| MasternodeEntry {
                pro_tx_hash: sha256d(&[i]),
                operator_public_key: SecretKey::from_seed(&[i]).unwrap().public_key(),
                peer: PeerId(u64::from(i)),
            })
            .collect();
        let config = LlmqConfig::single_type(LlmqParams::preset(LlmqType::LlmqTest));
        QuorumRegistry::new(
            Arc::new(config),
            Arc::new(FixedMembers(members)),
            Arc::new(KeyShareStore::new()),
        )
    }

    fn mined(base: BlockHeight) -> MinedCommitment {
        let mut commitment =
            FinalCommitment::null(LlmqType::LlmqTest, sha256d(&base.to_le_bytes()), 0, 3);
        commitment.valid_members = MemberSet::full(3);
        commitment.quorum_public_key =
            Some(SecretKey::from_seed(&base.to_le_bytes()).unwrap().public_key());
        MinedCommitment {
            commitment,
            base_height: base,
            mined_height: base + 11,
        }
    }

    #[test]
    fn test_null_commitments_form_no_quorum() {
        let reg = registry();
        let null = MinedCommitment {
            commitment: FinalCommitment::null(LlmqType::LlmqTest, sha256d(b"n"), 0, 3),
            base_height: 24,
            mined_height: 42,
        };
        reg.block_connected(42, &[null]);
        assert_eq!(reg.quorum_count(LlmqType::LlmqTest), 0);
        assert!(reg.lookup(LlmqType::LlmqTest, &sha256d(b"n")).is_none());
    }

    #[test]
    fn test_active_set_is_most_recent_first() {
        let reg = registry();
        for base in [24, 48, 72] {
            let m = mined(base);
            reg.block_connected(m.mined_height, &[m]);
        }
        let active = reg.active_quorums(LlmqType::LlmqTest);
        let bases: Vec<BlockHeight> = active.iter().map(|q| q.base_height).collect();
        assert_eq!(bases, vec![72, 48]);

        // As of height 60 only the quorum mined at 59 and the one before exist.
        let earlier = reg.active_quorums_at(LlmqType::LlmqTest, 60);
        let bases: Vec<BlockHeight> = earlier.iter().map(|q| q.base_height).collect();
        assert_eq!(bases, vec![48, 24]);
    }

    #[test]
    fn test_eviction_marks_quorums_expired() {
        let reg = registry();
        for base in [24, 48, 72, 96] {
            let m = mined(base);
            reg.block_connected(m.mined_height, &[m]);
        }
        assert_eq!(reg.quorum_count(LlmqType::LlmqTest), 3);
        let oldest = mined(24).commitment.quorum_hash;
        assert_matches!(
            reg.require_active(LlmqType::LlmqTest, &oldest),
            Err(LlmqError::QuorumExpired { .. })
        );
        assert_matches!(
            reg.require_active(LlmqType::LlmqTest, &sha256d(b"never")),
            Err(LlmqError::NotFound { .. })
        );
        assert!(reg
            .require_active(LlmqType::LlmqTest, &mined(96).commitment.quorum_hash)
            .is_ok());
    }

    #[test]
    fn test_selection_is_deterministic_and_offset() {
        let reg = registry();
        for base in [24, 48] {
            let m = mined(base);
            reg.block_connected(m.mined_height, &[m]);
        }
        let id = sha256d(b"request");
        let a = reg.select_quorum_for_signing(LlmqType::LlmqTest, &id, 70).unwrap();
        let b = reg.select_quorum_for_signing(LlmqType::LlmqTest, &id, 70).unwrap();
        assert_eq!(a.quorum_hash, b.quorum_hash);
        // The quorum mined at 59 is not selectable until 59 + offset.
        let early = reg.select_quorum_for_signing(LlmqType::LlmqTest, &id, 60).unwrap();
        assert_eq!(early.base_height, 24);
        assert!(reg.select_quorum_for_signing(LlmqType::LlmqTest, &id, 40).is_none());
    }

    #[test]
    fn test_disconnect_removes_quorum() {
        let reg = registry();
        let m = mined(24);
        reg.block_connected(35, &[m.clone()]);
        assert!(reg.lookup(LlmqType::LlmqTest, &m.commitment.quorum_hash).is_some());
        reg.block_disconnected(35, &[m.clone()]);
        assert!(reg.lookup(LlmqType::LlmqTest, &m.commitment.quorum_hash).is_none());
        assert_eq!(reg.tip(), 34);
    }
}
