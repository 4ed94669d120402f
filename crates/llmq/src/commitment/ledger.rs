//! Ledger of mined final commitments plus the pending pool used by block assembly

use super::FinalCommitment;
use crate::interfaces::{Block, ChainView, MasternodeList};
use llmq_core::{BlockHeight, Hash32, LlmqConfig, LlmqError, LlmqParams, LlmqType, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

type CommitmentKey = (LlmqType, Hash32);

/// A commitment together with where it was mined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedCommitment {
    /// The commitment
    pub commitment: FinalCommitment,
    /// Height of the quorum's base block
    pub base_height: BlockHeight,
    /// Height of the block that mined it
    pub mined_height: BlockHeight,
}

#[derive(Default)]
struct LedgerState {
    mined: HashMap<CommitmentKey, MinedCommitment>,
    by_height: BTreeMap<BlockHeight, Vec<CommitmentKey>>,
    pending: HashMap<CommitmentKey, FinalCommitment>,
}

/// Commitments consumed from connected blocks, in connection order
pub struct CommitmentLedger {
    config: Arc<LlmqConfig>,
    chain: Arc<dyn ChainView>,
    masternodes: Arc<dyn MasternodeList>,
    state: RwLock<LedgerState>,
}

impl CommitmentLedger {
    /// Create an empty ledger
    pub fn new(
        config: Arc<LlmqConfig>,
        chain: Arc<dyn ChainView>,
        masternodes: Arc<dyn MasternodeList>,
    ) -> Self {
        Self {
            config,
            chain,
            masternodes,
            state: RwLock::new(LedgerState::default()),
        }
    }

    fn base_height(&self, params: &LlmqParams, c: &FinalCommitment) -> Result<BlockHeight> {
        let base = self.chain.height_of(&c.quorum_hash).ok_or_else(|| {
            LlmqError::protocol(format!("commitment for unknown block {}", c.quorum_hash))
        })?;
        if c.quorum_index >= params.quorums_per_window
            || base % params.dkg_interval != c.quorum_index
        {
            return Err(LlmqError::protocol(format!(
                "block {} at height {base} does not start a {} window",
                c.quorum_hash, params.llmq_type
            )));
        }
        Ok(base)
    }

    /// Validate a commitment for inclusion at `height`
    fn check(&self, c: &FinalCommitment, height: BlockHeight) -> Result<BlockHeight> {
        let params = self
            .config
            .params_for(c.llmq_type)
            .ok_or_else(|| {
                LlmqError::protocol(format!("commitment for disabled type {}", c.llmq_type))
            })?;
        let base = self.base_height(params, c)?;
        if !params.in_mining_window(base, height) {
            return Err(LlmqError::protocol(format!(
                "commitment for {} mined at {height}, outside its window",
                c.quorum_hash
            )));
        }
        let members = self.masternodes.quorum_members(params, &c.quorum_hash);
        c.verify(params, &members)?;
        Ok(base)
    }

    /// Consume the commitments of a newly connected block.
    ///
    /// The block is checked as a whole: a duplicate, out-of-window or
    /// unverifiable commitment rejects the block and nothing is recorded.
    pub fn process_block(&self, block: &Block) -> Result<Vec<MinedCommitment>> {
        let mut accepted = Vec::with_capacity(block.commitments.len());
        {
            let state = self.state.read();
            for c in &block.commitments {
                let key = (c.llmq_type, c.quorum_hash);
                let repeated = accepted.iter().any(|m: &MinedCommitment| {
                    (m.commitment.llmq_type, m.commitment.quorum_hash) == key
                });
                if repeated || state.mined.contains_key(&key) {
                    return Err(LlmqError::protocol(format!(
                        "duplicate commitment for {} {}",
                        c.llmq_type, c.quorum_hash
                    )));
                }
                let base_height = self.check(c, block.height)?;
                accepted.push(MinedCommitment {
                    commitment: c.clone(),
                    base_height,
                    mined_height: block.height,
                });
            }
        }

        let mut state = self.state.write();
        for m in &accepted {
            let key = (m.commitment.llmq_type, m.commitment.quorum_hash);
            state.pending.remove(&key);
            state.mined.insert(key, m.clone());
            state.by_height.entry(block.height).or_default().push(key);
            info!(
                llmq_type = %m.commitment.llmq_type,
                quorum_hash = %m.commitment.quorum_hash.short(),
                height = block.height,
                null = m.commitment.is_null(),
                "commitment mined"
            );
        }
        Ok(accepted)
    }

    /// Revert the commitments of a disconnected block
    pub fn undo_block(&self, block: &Block) -> Vec<MinedCommitment> {
        let mut state = self.state.write();
        let keys = state.by_height.remove(&block.height).unwrap_or_default();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(m) = state.mined.remove(&key) {
                debug!(
                    quorum_hash = %key.1.short(),
                    height = block.height,
                    "commitment unmined"
                );
                if !m.commitment.is_null() {
                    state.pending.insert(key, m.commitment.clone());
                }
                removed.push(m);
            }
        }
        removed
    }

    /// Mined commitment for a quorum
    pub fn get_commitment(
        &self,
        llmq_type: LlmqType,
        quorum_hash: &Hash32,
    ) -> Option<MinedCommitment> {
        self.state.read().mined.get(&(llmq_type, *quorum_hash)).cloned()
    }

    /// Whether a commitment for the quorum has been mined
    pub fn has_mined_commitment(&self, llmq_type: LlmqType, quorum_hash: &Hash32) -> bool {
        self.state.read().mined.contains_key(&(llmq_type, *quorum_hash))
    }

    /// Up to `max` non-null mined commitments of a type, most recent first
    pub fn mined_commitments(&self, llmq_type: LlmqType, max: usize) -> Vec<MinedCommitment> {
        let state = self.state.read();
        let mut out: Vec<MinedCommitment> = state
            .mined
            .values()
            .filter(|m| m.commitment.llmq_type == llmq_type && !m.commitment.is_null())
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.base_height
                .cmp(&a.base_height)
                .then(b.mined_height.cmp(&a.mined_height))
        });
        out.truncate(max);
        out
    }

    /// Offer a commitment for block inclusion.
    ///
    /// Returns `true` when the pool changed. Per quorum the commitment with
    /// the most signers is kept.
    pub fn add_pending(&self, c: FinalCommitment) -> Result<bool> {
        let key = (c.llmq_type, c.quorum_hash);
        if self.has_mined_commitment(c.llmq_type, &c.quorum_hash) {
            return Ok(false);
        }
        if let Some(existing) = self.state.read().pending.get(&key) {
            if existing == &c || existing.signers.count() >= c.signers.count() {
                return Ok(false);
            }
        }

        let params = self.config.require_params(c.llmq_type)?;
        self.base_height(params, &c)?;
        let members = self.masternodes.quorum_members(params, &c.quorum_hash);
        c.verify(params, &members)?;

        let mut state = self.state.write();
        let replace = state
            .pending
            .get(&key)
            .map_or(true, |existing| existing.signers.count() < c.signers.count());
        if replace {
            debug!(
                llmq_type = %c.llmq_type,
                quorum_hash = %c.quorum_hash.short(),
                signers = c.signers.count(),
                "pending commitment"
            );
            state.pending.insert(key, c);
        }
        Ok(replace)
    }

    /// Commitments to include in a block at `height`.
    ///
    /// Quorums still unmined at the end of their mining window get a null
    /// commitment so the window is closed on chain.
    pub fn pending_for_block(&self, height: BlockHeight) -> Vec<FinalCommitment> {
        let state = self.state.read();
        let mut out = Vec::new();
        for params in &self.config.params {
            let base = params.window_base(height);
            for index in 0..params.quorums_per_window {
                let quorum_base = base + index;
                if !params.in_mining_window(quorum_base, height) {
                    continue;
                }
                let Some(quorum_hash) = self.chain.block_hash(quorum_base) else {
                    continue;
                };
                let key = (params.llmq_type, quorum_hash);
                if state.mined.contains_key(&key) {
                    continue;
                }
                if let Some(c) = state.pending.get(&key) {
                    out.push(c.clone());
                } else if height - quorum_base == params.dkg_mining_window_end {
                    let members = self.masternodes.quorum_members(params, &quorum_hash);
                    if !members.is_empty() {
                        out.push(FinalCommitment::null(
                            params.llmq_type,
                            quorum_hash,
                            index,
                            members.len(),
                        ));
                    }
                }
            }
        }
        out
    }

    /// Number of commitments waiting to be mined
    pub fn pending_count(&self) -> usize {
        self.state.read().pending.len()
    }
}
