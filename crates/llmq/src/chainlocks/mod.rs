//! Chain locks: quorum signatures that finalize a block
//!
//! Every masternode asks for a signature over the hash of each new tip under
//! the id `H("clsig", height)`. The first recovered signature, or a verified
//! lock from a peer, locks that block; locks only ever move to greater
//! heights.

mod handler;

pub use handler::{ChainLockEvent, ChainLockHandler};

use llmq_core::crypto::Signature;
use llmq_core::{chain_lock_request_id, BlockHeight, Hash32};
use serde::{Deserialize, Serialize};

/// A chain lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLockSig {
    /// Locked height
    pub height: BlockHeight,
    /// Locked block
    pub block_hash: Hash32,
    /// Recovered quorum signature
    pub sig: Signature,
}

impl ChainLockSig {
    /// Signing request id for the lock's height
    pub fn request_id(&self) -> Hash32 {
        chain_lock_request_id(self.height)
    }
}

/// Effect of offering a lock to the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLockOutcome {
    /// The lock advanced
    Accepted,
    /// Below the current lock
    Stale,
    /// At the current lock's height
    Redundant,
}

/// Best lock seen so far. Its height never decreases.
#[derive(Debug, Clone, Default)]
pub struct ChainLockState {
    best: Option<ChainLockSig>,
}

impl ChainLockState {
    /// Offer a lock; the state changes only when the result is `Accepted`
    pub fn try_advance(&mut self, clsig: &ChainLockSig) -> ChainLockOutcome {
        match &self.best {
            Some(best) if clsig.height < best.height => ChainLockOutcome::Stale,
            Some(best) if clsig.height == best.height => ChainLockOutcome::Redundant,
            _ => {
                self.best = Some(clsig.clone());
                ChainLockOutcome::Accepted
            }
        }
    }

    /// Current lock
    pub fn best(&self) -> Option<&ChainLockSig> {
        self.best.as_ref()
    }

    /// Height of the current lock
    pub fn height(&self) -> Option<BlockHeight> {
        self.best.as_ref().map(|b| b.height)
    }
}

/// Notified, in order, of each accepted chain lock
pub trait ChainLockListener: Send + Sync {
    /// A new chain lock was accepted
    fn on_chain_lock(&self, clsig: &ChainLockSig);
}

/// Read side of chain-lock state for validation code
pub trait ChainLockView: Send + Sync {
    /// Whether the block is at or below the locked block on the active chain
    fn is_block_locked(&self, block_hash: &Hash32) -> bool;

    /// Whether a block at `height` with `block_hash` contradicts the lock
    fn would_conflict_with_lock(&self, height: BlockHeight, block_hash: &Hash32) -> bool;

    /// The best accepted lock
    fn best_chain_lock(&self) -> Option<ChainLockSig>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_core::crypto::SecretKey;
    use llmq_core::sha256d;
    use proptest::prelude::*;

    fn clsig(height: BlockHeight) -> ChainLockSig {
        let block_hash = sha256d(&height.to_le_bytes());
        ChainLockSig {
            height,
            block_hash,
            sig: SecretKey::from_seed(b"quorum").unwrap().sign(&block_hash),
        }
    }

    #[test]
    fn test_stale_and_redundant_locks_are_ignored() {
        let mut state = ChainLockState::default();
        assert_eq!(state.try_advance(&clsig(10)), ChainLockOutcome::Accepted);
        assert_eq!(state.try_advance(&clsig(9)), ChainLockOutcome::Stale);
        assert_eq!(state.try_advance(&clsig(10)), ChainLockOutcome::Redundant);
        assert_eq!(state.height(), Some(10));
        assert_eq!(state.try_advance(&clsig(12)), ChainLockOutcome::Accepted);
        assert_eq!(state.best().map(|b| b.block_hash), Some(clsig(12).block_hash));
    }

    proptest! {
        #[test]
        fn prop_locked_height_never_decreases(heights in proptest::collection::vec(0u32..1000, 1..40)) {
            let mut state = ChainLockState::default();
            let sig = SecretKey::from_seed(b"quorum").unwrap().sign(&sha256d(b"b"));
            let mut previous: Option<BlockHeight> = None;
            for h in heights {
                let lock = ChainLockSig { height: h, block_hash: sha256d(&h.to_le_bytes()), sig };
                let before = state.clone();
                let outcome = state.try_advance(&lock);
                match outcome {
                    ChainLockOutcome::Accepted => {
                        prop_assert!(previous.map_or(true, |p| h > p));
                        previous = Some(h);
                    }
                    ChainLockOutcome::Stale | ChainLockOutcome::Redundant => {
                        prop_assert_eq!(before.best(), state.best());
                    }
                }
                prop_assert_eq!(state.height(), previous);
            }
        }
    }
}
