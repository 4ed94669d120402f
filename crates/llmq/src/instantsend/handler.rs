//! Instant-lock signing, acceptance, retraction and gossip

use super::InstantLock;
use crate::chainlocks::{ChainLockListener, ChainLockSig};
use crate::interfaces::{Block, NetworkHandle, NetworkSlot, ValidationEngine};
use crate::messages::LlmqMessage;
use crate::signing::{RecoveredSig, RecoveredSigListener, SigningCoordinator};
use crate::worker::Worker;
use llmq_core::{
    instant_lock_request_id, BlockHeight, Hash32, LlmqConfig, LlmqError, OutPoint, PeerId, Result,
    Transaction,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

const INVALID_ISLOCK_SCORE: u32 = 10;

/// Input to the instant-lock worker
#[derive(Debug)]
pub enum InstantLockEvent {
    /// A lock gossiped by a peer
    Inbound {
        /// Sending peer
        from: PeerId,
        /// The lock
        lock: InstantLock,
    },
}

/// What a chain lock did to the instant locks below it
#[derive(Debug, Default, PartialEq, Eq)]
struct ChainLockEffects {
    retracted: Vec<Hash32>,
    archived: Vec<Hash32>,
}

/// A transaction we asked the quorum to lock
#[derive(Debug, Clone)]
struct PendingTx {
    tx: Transaction,
    seen_at: BlockHeight,
}

/// Locks, locked inputs and the mined transactions that may still conflict
#[derive(Default)]
struct LockIndex {
    locks: HashMap<Hash32, InstantLock>,
    by_input: HashMap<OutPoint, Hash32>,
    /// Transactions awaiting a recovered signature, by request id. Spends
    /// of the same inputs share an id; the recovered message picks one.
    pending: HashMap<Hash32, Vec<PendingTx>>,
    /// Mined transactions not yet covered by a chain lock
    mined: BTreeMap<BlockHeight, Vec<Transaction>>,
    /// Locks superseded by a chain lock, with the chain-locked height
    archived: HashMap<Hash32, BlockHeight>,
    tip: BlockHeight,
}

impl LockIndex {
    fn conflicting(&self, tx: &Transaction) -> Option<&InstantLock> {
        tx.inputs
            .iter()
            .filter_map(|input| self.by_input.get(input))
            .find(|owner| **owner != tx.txid)
            .and_then(|owner| self.locks.get(owner))
    }

    /// `Ok(false)` for a lock we already hold
    fn insert(&mut self, lock: InstantLock) -> Result<bool> {
        if self.locks.contains_key(&lock.txid) || self.archived.contains_key(&lock.txid) {
            return Ok(false);
        }
        if let Some(owner) = lock
            .inputs
            .iter()
            .find_map(|input| self.by_input.get(input).filter(|o| **o != lock.txid))
        {
            return Err(LlmqError::conflict(format!(
                "{} spends inputs locked by {}",
                lock.txid.short(),
                owner.short()
            )));
        }
        for input in &lock.inputs {
            self.by_input.insert(*input, lock.txid);
        }
        self.pending.remove(&lock.request_id());
        self.locks.insert(lock.txid, lock);
        Ok(true)
    }

    /// Record `tx` as a candidate for request `id`; the first spend seen stays first
    fn add_pending(&mut self, id: Hash32, tx: &Transaction) {
        let seen_at = self.tip;
        let candidates = self.pending.entry(id).or_default();
        if !candidates.iter().any(|p| p.tx.txid == tx.txid) {
            candidates.push(PendingTx {
                tx: tx.clone(),
                seen_at,
            });
        }
    }

    /// Candidate for `id` whose txid is the signed message
    fn pending_for(&self, id: &Hash32, msg_hash: &Hash32) -> Option<Transaction> {
        self.pending
            .get(id)?
            .iter()
            .find(|p| p.tx.txid == *msg_hash)
            .map(|p| p.tx.clone())
    }

    fn forget_pending(&mut self, txid: &Hash32) {
        self.pending.retain(|_, candidates| {
            candidates.retain(|p| p.tx.txid != *txid);
            !candidates.is_empty()
        });
    }

    fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    fn remove(&mut self, txid: &Hash32) -> Option<InstantLock> {
        let lock = self.locks.remove(txid)?;
        for input in &lock.inputs {
            if self.by_input.get(input) == Some(txid) {
                self.by_input.remove(input);
            }
        }
        Some(lock)
    }

    /// Record mined transactions and drop what can no longer be signed or
    /// chain-locked: pending requests older than `expiry` and mined blocks
    /// older than `retention`.
    fn block_connected(
        &mut self,
        height: BlockHeight,
        transactions: &[Transaction],
        expiry: u32,
        retention: u32,
    ) {
        self.tip = height;
        if !transactions.is_empty() {
            self.mined.insert(height, transactions.to_vec());
        }
        let mined_floor = height.saturating_sub(retention);
        self.mined = self.mined.split_off(&mined_floor);
        let pending_floor = height.saturating_sub(expiry);
        self.pending.retain(|_, candidates| {
            candidates.retain(|p| p.seen_at >= pending_floor);
            !candidates.is_empty()
        });
    }

    fn block_disconnected(&mut self, height: BlockHeight) {
        self.mined.remove(&height);
        self.tip = height.saturating_sub(1);
    }

    /// Retract locks contradicted by chain-locked spends, then archive the
    /// locked transactions the chain lock covers.
    fn on_chain_lock(&mut self, height: BlockHeight, retention: u32) -> ChainLockEffects {
        let above = self.mined.split_off(&height.saturating_add(1));
        let covered = std::mem::replace(&mut self.mined, above);
        let mut effects = ChainLockEffects::default();

        for tx in covered.values().flatten() {
            for input in &tx.inputs {
                let Some(owner) = self.by_input.get(input).copied() else {
                    continue;
                };
                if owner != tx.txid && self.remove(&owner).is_some() {
                    effects.retracted.push(owner);
                }
            }
        }
        for tx in covered.values().flatten() {
            self.forget_pending(&tx.txid);
            if self.remove(&tx.txid).is_some() {
                self.archived.insert(tx.txid, height);
                effects.archived.push(tx.txid);
            }
        }
        let floor = height.saturating_sub(retention);
        self.archived.retain(|_, h| *h >= floor);
        effects
    }
}

struct InstantLockShared {
    config: Arc<LlmqConfig>,
    signing: Arc<SigningCoordinator>,
    validation: Arc<dyn ValidationEngine>,
    is_masternode: bool,
    index: Mutex<LockIndex>,
    network: NetworkSlot,
}

/// Instant-lock handler, one per context
pub struct InstantLockHandler {
    shared: Arc<InstantLockShared>,
    worker: Worker<InstantLockEvent>,
}

impl InstantLockHandler {
    /// Create the handler
    pub fn new(
        config: Arc<LlmqConfig>,
        signing: Arc<SigningCoordinator>,
        validation: Arc<dyn ValidationEngine>,
        is_masternode: bool,
    ) -> Self {
        let capacity = config.worker_queue_capacity;
        Self {
            shared: Arc::new(InstantLockShared {
                config,
                signing,
                validation,
                is_masternode,
                index: Mutex::new(LockIndex::default()),
                network: NetworkSlot::default(),
            }),
            worker: Worker::new("instantsend", capacity),
        }
    }

    /// Start the worker
    pub fn start(&self, network: Arc<dyn NetworkHandle>) -> Result<()> {
        self.shared.network.set(network);
        let shared = Arc::clone(&self.shared);
        self.worker.start(move |batch| {
            for InstantLockEvent::Inbound { from, lock } in batch {
                shared.on_inbound(from, lock);
            }
        })
    }

    /// Make the worker exit
    pub fn interrupt(&self) {
        self.worker.interrupt();
    }

    /// Join the worker and detach from the network
    pub fn stop(&self) {
        self.worker.stop();
        self.shared.network.clear();
    }

    /// Whether the worker has nothing queued
    pub fn is_idle(&self) -> bool {
        self.worker.is_idle()
    }

    /// Queue a lock gossiped by a peer
    pub fn process_message(&self, from: PeerId, lock: InstantLock) {
        if self.worker.is_running() {
            self.worker.submit(InstantLockEvent::Inbound { from, lock });
        }
    }

    /// A transaction entered the mempool.
    ///
    /// Fails with `Conflict` when one of its inputs is locked by another
    /// transaction. Returns whether a signature was requested.
    pub fn process_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.inputs.is_empty() {
            return Err(LlmqError::invalid(format!(
                "transaction {} has no inputs",
                tx.txid.short()
            )));
        }
        let id = instant_lock_request_id(&tx.inputs);
        {
            let mut index = self.shared.index.lock();
            if let Some(lock) = index.conflicting(tx) {
                return Err(LlmqError::conflict(format!(
                    "{} conflicts with instant lock on {}",
                    tx.txid.short(),
                    lock.txid.short()
                )));
            }
            if index.locks.contains_key(&tx.txid) {
                return Ok(false);
            }
            if !self.shared.is_masternode || !self.worker.is_running() {
                return Ok(false);
            }
            index.add_pending(id, tx);
        }
        self.shared
            .signing
            .request_signature(self.shared.config.instant_send_type, id, tx.txid)
    }

    /// Lock conflicting with `tx`, if any
    pub fn conflicting_lock(&self, tx: &Transaction) -> Option<InstantLock> {
        self.shared.index.lock().conflicting(tx).cloned()
    }

    /// Whether the transaction is instant-locked
    pub fn is_locked(&self, txid: &Hash32) -> bool {
        self.shared.index.lock().locks.contains_key(txid)
    }

    /// Lock held for the transaction
    pub fn get_lock(&self, txid: &Hash32) -> Option<InstantLock> {
        self.shared.index.lock().locks.get(txid).cloned()
    }

    /// Whether the transaction's lock was superseded by a chain lock
    pub fn is_archived(&self, txid: &Hash32) -> bool {
        self.shared.index.lock().archived.contains_key(txid)
    }

    /// Number of live locks
    pub fn lock_count(&self) -> usize {
        self.shared.index.lock().locks.len()
    }

    /// Number of transactions awaiting a recovered signature
    pub fn pending_count(&self) -> usize {
        self.shared.index.lock().pending_count()
    }

    /// Record the block's transactions as mined
    pub fn block_connected(&self, block: &Block) {
        let config = &self.shared.config;
        self.shared.index.lock().block_connected(
            block.height,
            &block.transactions,
            config.sig_share_expiry_blocks,
            config.recovered_sig_retention_blocks,
        );
    }

    /// Forget the block's transactions
    pub fn block_disconnected(&self, block: &Block) {
        self.shared.index.lock().block_disconnected(block.height);
    }
}

impl InstantLockShared {
    fn on_inbound(&self, from: PeerId, lock: InstantLock) {
        if lock.inputs.is_empty() {
            self.network
                .misbehaving(from, INVALID_ISLOCK_SCORE, "instant lock without inputs");
            return;
        }
        {
            let index = self.index.lock();
            if index.locks.contains_key(&lock.txid) || index.archived.contains_key(&lock.txid) {
                trace!(%from, txid = %lock.txid.short(), "known instant lock");
                return;
            }
        }
        let verified = self.signing.verify_with_quorum(
            self.config.instant_send_type,
            &lock.quorum_hash,
            &lock.request_id(),
            &lock.txid,
            &lock.sig,
        );
        match verified {
            Ok(true) => self.accept(lock),
            Ok(false) => {
                warn!(%from, txid = %lock.txid.short(), "invalid instant lock signature");
                self.network
                    .misbehaving(from, INVALID_ISLOCK_SCORE, "invalid instant lock signature");
            }
            Err(e) => debug!(%from, txid = %lock.txid.short(), error = %e, "instant lock not verifiable"),
        }
    }

    fn accept(&self, lock: InstantLock) {
        let txid = lock.txid;
        let inserted = self.index.lock().insert(lock.clone());
        match inserted {
            Ok(true) => {
                info!(txid = %txid.short(), inputs = lock.inputs.len(), "instant lock accepted");
                self.validation.instant_lock_accepted(&txid);
                self.network.broadcast(LlmqMessage::InstantLock(lock));
            }
            Ok(false) => trace!(txid = %txid.short(), "duplicate instant lock"),
            Err(e) => warn!(error = %e, "instant lock rejected"),
        }
    }
}

impl RecoveredSigListener for InstantLockHandler {
    fn on_recovered(&self, sig: &RecoveredSig) {
        let tx = self.shared.index.lock().pending_for(&sig.id, &sig.msg_hash);
        let Some(tx) = tx else {
            trace!(id = %sig.id.short(), "recovered signature for unknown transaction");
            return;
        };
        self.shared.accept(InstantLock {
            txid: tx.txid,
            inputs: tx.inputs,
            quorum_hash: sig.quorum_hash,
            sig: sig.sig,
        });
    }
}

impl ChainLockListener for InstantLockHandler {
    fn on_chain_lock(&self, clsig: &ChainLockSig) {
        let effects = self
            .shared
            .index
            .lock()
            .on_chain_lock(clsig.height, self.shared.config.recovered_sig_retention_blocks);
        for txid in &effects.retracted {
            warn!(txid = %txid.short(), height = clsig.height, "instant lock retracted by chain lock");
            self.shared.validation.instant_lock_retracted(txid);
        }
        if !effects.archived.is_empty() {
            debug!(count = effects.archived.len(), height = clsig.height, "instant locks archived");
        }
    }
}

impl std::fmt::Debug for InstantLockHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantLockHandler")
            .field("locks", &self.lock_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use llmq_core::crypto::SecretKey;
    use llmq_core::sha256d;

    fn outpoint(tag: &[u8], vout: u32) -> OutPoint {
        OutPoint::new(sha256d(tag), vout)
    }

    fn tx(tag: &[u8], inputs: Vec<OutPoint>) -> Transaction {
        Transaction::new(sha256d(tag), inputs)
    }

    fn lock_for(tx: &Transaction) -> InstantLock {
        InstantLock {
            txid: tx.txid,
            inputs: tx.inputs.clone(),
            quorum_hash: sha256d(b"quorum"),
            sig: SecretKey::from_seed(b"quorum").unwrap().sign(&tx.txid),
        }
    }

    #[test]
    fn test_conflicting_spend_is_detected() {
        let mut index = LockIndex::default();
        let a = tx(b"a", vec![outpoint(b"funding", 0), outpoint(b"funding", 1)]);
        let b = tx(b"b", vec![outpoint(b"funding", 1)]);
        assert_eq!(index.insert(lock_for(&a)).unwrap(), true);
        assert_eq!(index.insert(lock_for(&a)).unwrap(), false);

        assert_eq!(index.conflicting(&b).map(|l| l.txid), Some(a.txid));
        assert!(index.conflicting(&a).is_none());
        assert_matches!(index.insert(lock_for(&b)), Err(LlmqError::Conflict { .. }));
    }

    #[test]
    fn test_chain_lock_retracts_conflicting_instant_lock() {
        let mut index = LockIndex::default();
        let locked = tx(b"locked", vec![outpoint(b"funding", 0)]);
        let double_spend = tx(b"double-spend", vec![outpoint(b"funding", 0)]);
        index.insert(lock_for(&locked)).unwrap();

        index.block_connected(30, std::slice::from_ref(&double_spend), 8, 100);
        let effects = index.on_chain_lock(30, 100);

        assert_eq!(effects.retracted, vec![locked.txid]);
        assert!(effects.archived.is_empty());
        assert!(index.locks.is_empty());
        assert!(index.conflicting(&double_spend).is_none());
    }

    #[test]
    fn test_mined_locked_transaction_is_archived() {
        let mut index = LockIndex::default();
        let locked = tx(b"locked", vec![outpoint(b"funding", 0)]);
        index.insert(lock_for(&locked)).unwrap();

        index.block_connected(31, std::slice::from_ref(&locked), 8, 100);
        assert_eq!(index.on_chain_lock(30, 100), ChainLockEffects::default());
        assert!(index.locks.contains_key(&locked.txid));

        let effects = index.on_chain_lock(31, 100);
        assert_eq!(effects.archived, vec![locked.txid]);
        assert!(effects.retracted.is_empty());
        assert!(index.archived.contains_key(&locked.txid));
        assert_eq!(index.insert(lock_for(&locked)).unwrap(), false);
    }

    #[test]
    fn test_mempool_double_spend_keeps_first_candidate() {
        let mut index = LockIndex::default();
        let first = tx(b"first", vec![outpoint(b"funding", 0)]);
        let second = tx(b"second", vec![outpoint(b"funding", 0)]);
        let id = instant_lock_request_id(&first.inputs);
        index.add_pending(id, &first);
        index.add_pending(id, &second);
        index.add_pending(id, &first);

        assert_eq!(index.pending_count(), 2);
        assert_eq!(index.pending_for(&id, &first.txid), Some(first.clone()));
        assert_eq!(index.pending_for(&id, &second.txid), Some(second));
        assert!(index.pending_for(&id, &sha256d(b"other")).is_none());

        index.insert(lock_for(&first)).unwrap();
        assert_eq!(index.pending_count(), 0);
    }

    #[test]
    fn test_stale_pending_and_mined_entries_are_pruned() {
        let mut index = LockIndex::default();
        index.block_connected(10, &[tx(b"mined", vec![outpoint(b"funding", 1)])], 8, 20);
        let waiting = tx(b"waiting", vec![outpoint(b"funding", 2)]);
        index.add_pending(instant_lock_request_id(&waiting.inputs), &waiting);

        index.block_connected(18, &[], 8, 20);
        assert_eq!(index.pending_count(), 1);
        assert_eq!(index.mined.len(), 1);

        index.block_connected(19, &[], 8, 20);
        assert_eq!(index.pending_count(), 0);

        index.block_connected(31, &[], 8, 20);
        assert!(index.mined.is_empty());
    }

    #[test]
    fn test_disconnected_block_no_longer_conflicts() {
        let mut index = LockIndex::default();
        let locked = tx(b"locked", vec![outpoint(b"funding", 0)]);
        let double_spend = tx(b"double-spend", vec![outpoint(b"funding", 0)]);
        index.insert(lock_for(&locked)).unwrap();

        index.block_connected(30, std::slice::from_ref(&double_spend), 8, 100);
        index.block_disconnected(30);
        let effects = index.on_chain_lock(30, 100);

        assert!(effects.retracted.is_empty());
        assert!(index.locks.contains_key(&locked.txid));
    }
}
