//! Mock active chain

use llmq::ChainView;
use llmq_core::{BlockHeight, Hash32, Hasher};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct ChainState {
    hashes: Vec<Hash32>,
    heights: HashMap<Hash32, BlockHeight>,
    /// Blocks ever created, so re-mined heights get fresh hashes
    created: u64,
}

/// Active chain of block hashes, starting at a genesis block
pub struct MockChain {
    state: RwLock<ChainState>,
}

impl MockChain {
    /// Chain holding only the genesis block
    pub fn new() -> Self {
        let chain = Self {
            state: RwLock::new(ChainState::default()),
        };
        chain.append();
        chain
    }

    /// Extend the tip; returns the new height, hash and parent hash
    pub fn append(&self) -> (BlockHeight, Hash32, Hash32) {
        let mut state = self.state.write();
        let height = state.hashes.len() as BlockHeight;
        let prev = state.hashes.last().copied().unwrap_or_default();
        let mut h = Hasher::tagged("mock-block");
        h.update_u32(height).update_u64(state.created);
        let hash = h.finalize();
        state.created += 1;
        state.hashes.push(hash);
        state.heights.insert(hash, height);
        (height, hash, prev)
    }

    /// Remove the tip; the genesis block stays
    pub fn pop(&self) -> Option<(BlockHeight, Hash32)> {
        let mut state = self.state.write();
        if state.hashes.len() <= 1 {
            return None;
        }
        let hash = state.hashes.pop()?;
        state.heights.remove(&hash);
        Some((state.hashes.len() as BlockHeight, hash))
    }
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainView for MockChain {
    fn tip_height(&self) -> BlockHeight {
        (self.state.read().hashes.len() as BlockHeight).saturating_sub(1)
    }

    fn block_hash(&self, height: BlockHeight) -> Option<Hash32> {
        self.state.read().hashes.get(height as usize).copied()
    }

    fn height_of(&self, hash: &Hash32) -> Option<BlockHeight> {
        self.state.read().heights.get(hash).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorged_height_gets_new_hash() {
        let chain = MockChain::new();
        let (h1, first, genesis) = chain.append();
        assert_eq!(h1, 1);
        assert_eq!(chain.block_hash(0), Some(genesis));
        assert_eq!(chain.pop(), Some((1, first)));
        assert_eq!(chain.height_of(&first), None);

        let (h1, second, _) = chain.append();
        assert_eq!(h1, 1);
        assert_ne!(first, second);
        assert_eq!(chain.tip_height(), 1);
        assert_eq!(chain.height_of(&second), Some(1));
    }
}
