//! Chain-lock signing, acceptance and gossip

use super::{ChainLockListener, ChainLockOutcome, ChainLockSig, ChainLockState, ChainLockView};
use crate::interfaces::{ChainView, NetworkHandle, NetworkSlot, ValidationEngine};
use crate::messages::LlmqMessage;
use crate::signing::{RecoveredSig, RecoveredSigListener, SigningCoordinator};
use crate::worker::Worker;
use llmq_core::{chain_lock_request_id, BlockHeight, Hash32, LlmqConfig, PeerId, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Score for a chain lock whose signature does not verify
const INVALID_CLSIG_SCORE: u32 = 10;

/// Input to the chain-lock worker
#[derive(Debug)]
pub enum ChainLockEvent {
    /// A lock gossiped by a peer
    Inbound {
        /// Sending peer
        from: PeerId,
        /// The lock
        clsig: ChainLockSig,
    },
}

#[derive(Default)]
struct HandlerState {
    lock: ChainLockState,
    /// Heights we asked to sign, with request id and block hash
    requested: BTreeMap<BlockHeight, (Hash32, Hash32)>,
    tip: BlockHeight,
}

struct ChainLockShared {
    config: Arc<LlmqConfig>,
    chain: Arc<dyn ChainView>,
    signing: Arc<SigningCoordinator>,
    validation: Arc<dyn ValidationEngine>,
    is_masternode: bool,
    state: Mutex<HandlerState>,
    listeners: RwLock<Vec<Arc<dyn ChainLockListener>>>,
    network: NetworkSlot,
}

/// Chain-lock handler, one per context
pub struct ChainLockHandler {
    shared: Arc<ChainLockShared>,
    worker: Worker<ChainLockEvent>,
}

impl ChainLockHandler {
    /// Create the handler
    pub fn new(
        config: Arc<LlmqConfig>,
        chain: Arc<dyn ChainView>,
        signing: Arc<SigningCoordinator>,
        validation: Arc<dyn ValidationEngine>,
        is_masternode: bool,
    ) -> Self {
        let capacity = config.worker_queue_capacity;
        Self {
            shared: Arc::new(ChainLockShared {
                config,
                chain,
                signing,
                validation,
                is_masternode,
                state: Mutex::new(HandlerState::default()),
                listeners: RwLock::new(Vec::new()),
                network: NetworkSlot::default(),
            }),
            worker: Worker::new("chainlocks", capacity),
        }
    }

    /// Add a listener for accepted locks
    pub fn register_listener(&self, listener: Arc<dyn ChainLockListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Drop every listener
    pub fn clear_listeners(&self) {
        self.shared.listeners.write().clear();
    }

    /// Start the worker
    pub fn start(&self, network: Arc<dyn NetworkHandle>) -> Result<()> {
        self.shared.network.set(network);
        let shared = Arc::clone(&self.shared);
        self.worker.start(move |batch| {
            for ChainLockEvent::Inbound { from, clsig } in batch {
                shared.on_inbound(from, clsig);
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
    pub fn process_message(&self, from: PeerId, clsig: ChainLockSig) {
        if self.worker.is_running() {
            self.worker.submit(ChainLockEvent::Inbound { from, clsig });
        }
    }

    /// A new tip was connected; masternodes ask for it to be signed
    pub fn update_tip(&self, height: BlockHeight, block_hash: Hash32) {
        let retention = self.shared.config.recovered_sig_retention_blocks;
        let id = chain_lock_request_id(height);
        {
            let mut state = self.shared.state.lock();
            state.tip = height;
            let keep_from = height.saturating_sub(retention);
            state.requested = state.requested.split_off(&keep_from);
            if state.lock.height().is_some_and(|h| h >= height) {
                return;
            }
            if self.shared.is_masternode {
                state.requested.insert(height, (id, block_hash));
            }
        }
        if !self.shared.is_masternode || !self.worker.is_running() {
            return;
        }
        match self
            .shared
            .signing
            .request_signature(self.shared.config.chain_locks_type, id, block_hash)
        {
            Ok(true) => trace!(height, "chain lock requested"),
            Ok(false) => debug!(height, "chain lock request refused"),
            Err(e) => debug!(height, error = %e, "chain lock not requested"),
        }
    }

    /// Best accepted lock
    pub fn best_chain_lock(&self) -> Option<ChainLockSig> {
        self.shared.state.lock().lock.best().cloned()
    }

    /// Offer a lock that is already known to be valid
    pub fn process_new_chain_lock(&self, clsig: ChainLockSig) -> ChainLockOutcome {
        self.shared.process_new(clsig)
    }
}

impl ChainLockShared {
    fn on_inbound(&self, from: PeerId, clsig: ChainLockSig) {
        if self
            .state
            .lock()
            .lock
            .height()
            .is_some_and(|h| clsig.height <= h)
        {
            trace!(%from, height = clsig.height, "stale chain lock");
            return;
        }
        let verified = self.signing.verify_recovered_sig(
            self.config.chain_locks_type,
            clsig.height,
            &clsig.request_id(),
            &clsig.block_hash,
            &clsig.sig,
        );
        match verified {
            Ok(true) => {
                self.process_new(clsig);
            }
            Ok(false) => {
                warn!(%from, height = clsig.height, "invalid chain lock signature");
                self.network
                    .misbehaving(from, INVALID_CLSIG_SCORE, "invalid chain lock signature");
            }
            Err(e) => debug!(%from, height = clsig.height, error = %e, "chain lock not verifiable"),
        }
    }

    fn process_new(&self, clsig: ChainLockSig) -> ChainLockOutcome {
        let outcome = self.state.lock().lock.try_advance(&clsig);
        if outcome != ChainLockOutcome::Accepted {
            trace!(height = clsig.height, ?outcome, "chain lock ignored");
            return outcome;
        }
        info!(
            height = clsig.height,
            block_hash = %clsig.block_hash.short(),
            "chain lock accepted"
        );
        self.validation
            .enforce_chain_lock(clsig.height, &clsig.block_hash);
        let listeners = self.listeners.read().clone();
        for l in &listeners {
            l.on_chain_lock(&clsig);
        }
        self.network.broadcast(LlmqMessage::ChainLock(clsig));
        outcome
    }

    /// Height a chain-lock request id was made for
    fn height_for_id(&self, id: &Hash32) -> Option<BlockHeight> {
        let state = self.state.lock();
        if let Some((h, _)) = state.requested.iter().find(|(_, (rid, _))| rid == id) {
            return Some(*h);
        }
        let floor = state
            .tip
            .saturating_sub(self.config.recovered_sig_retention_blocks);
        (floor..=state.tip)
            .rev()
            .find(|h| &chain_lock_request_id(*h) == id)
    }
}

impl RecoveredSigListener for ChainLockHandler {
    fn on_recovered(&self, sig: &RecoveredSig) {
        let Some(height) = self.shared.height_for_id(&sig.id) else {
            trace!(id = %sig.id.short(), "recovered signature is not a chain lock");
            return;
        };
        self.shared.process_new(ChainLockSig {
            height,
            block_hash: sig.msg_hash,
            sig: sig.sig,
        });
    }
}

impl ChainLockView for ChainLockHandler {
    fn is_block_locked(&self, block_hash: &Hash32) -> bool {
        let Some(best) = self.best_chain_lock() else {
            return false;
        };
        let chain = &self.shared.chain;
        if chain.block_hash(best.height) != Some(best.block_hash) {
            return false;
        }
        chain.height_of(block_hash).is_some_and(|h| h <= best.height)
    }

    fn would_conflict_with_lock(&self, height: BlockHeight, block_hash: &Hash32) -> bool {
        let Some(best) = self.best_chain_lock() else {
            return false;
        };
        if height > best.height {
            return false;
        }
        if height == best.height {
            return &best.block_hash != block_hash;
        }
        let chain = &self.shared.chain;
        chain.block_hash(best.height) == Some(best.block_hash)
            && chain.block_hash(height).is_some_and(|h| &h != block_hash)
    }

    fn best_chain_lock(&self) -> Option<ChainLockSig> {
        ChainLockHandler::best_chain_lock(self)
    }
}

impl std::fmt::Debug for ChainLockHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainLockHandler")
            .field("best", &self.best_chain_lock().map(|b| b.height))
            .finish()
    }
}

