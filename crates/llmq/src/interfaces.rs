//! Collaborators the subsystem consumes but does not implement
//!
//! Transport, chain state, the masternode list, block validation and fork
//! activation all live outside the subsystem. Components receive them as
//! `Arc<dyn Trait>` handles at construction (or at `start`, for the network).

use crate::commitment::FinalCommitment;
use crate::ehf::UpgradeSignal;
use crate::messages::LlmqMessage;
use llmq_core::crypto::{PublicKey, SecretKey};
use llmq_core::{BlockHeight, Hash32, LlmqParams, PeerId, ProTxHash, Transaction};
use parking_lot::RwLock;
use std::sync::Arc;

/// A connected block, as far as the subsystem is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Height in the active chain
    pub height: BlockHeight,
    /// Block hash
    pub hash: Hash32,
    /// Parent hash
    pub prev_hash: Hash32,
    /// Transactions, coinbase excluded
    pub transactions: Vec<Transaction>,
    /// Final quorum commitments mined in this block
    pub commitments: Vec<FinalCommitment>,
}

/// Read access to the active chain
pub trait ChainView: Send + Sync {
    /// Height of the active tip
    fn tip_height(&self) -> BlockHeight;

    /// Hash of the active-chain block at `height`
    fn block_hash(&self, height: BlockHeight) -> Option<Hash32>;

    /// Height of a block on the active chain
    fn height_of(&self, hash: &Hash32) -> Option<BlockHeight>;
}

/// A registered masternode as seen by quorum formation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasternodeEntry {
    /// Registration hash
    pub pro_tx_hash: ProTxHash,
    /// Operator key used for DKG messages and commitment member signatures
    pub operator_public_key: PublicKey,
    /// Where the masternode can be reached
    pub peer: PeerId,
}

/// Deterministic committee selection, owned by the masternode list manager
pub trait MasternodeList: Send + Sync {
    /// Ordered committee for the quorum based at `quorum_hash`
    fn quorum_members(&self, params: &LlmqParams, quorum_hash: &Hash32) -> Vec<MasternodeEntry>;
}

/// Callbacks into block and mempool validation
pub trait ValidationEngine: Send + Sync {
    /// Competing blocks at or below `height` must now be rejected
    fn enforce_chain_lock(&self, _height: BlockHeight, _block_hash: &Hash32) {}

    /// A transaction became instant-locked
    fn instant_lock_accepted(&self, _txid: &Hash32) {}

    /// An instant lock was superseded by a chain lock
    fn instant_lock_retracted(&self, _txid: &Hash32) {}
}

/// External fork-activation mechanism
pub trait ForkActivation: Send + Sync {
    /// Called at most once per distinct signal
    fn notify_activation_signal(&self, signal: &UpgradeSignal);
}

/// Outbound side of the peer-to-peer transport. Delivery is at most once.
pub trait NetworkHandle: Send + Sync {
    /// This node's peer id
    fn local_peer(&self) -> PeerId;

    /// Send to every connected peer
    fn broadcast(&self, msg: LlmqMessage);

    /// Send to one peer
    fn send_to(&self, peer: PeerId, msg: LlmqMessage);

    /// Send to every listed quorum member except ourselves
    fn send_to_members(&self, members: &[MasternodeEntry], msg: LlmqMessage) {
        let local = self.local_peer();
        for member in members.iter().filter(|m| m.peer != local) {
            self.send_to(member.peer, msg.clone());
        }
    }

    /// Report a peer-attributable protocol fault
    fn misbehaving(&self, peer: PeerId, score: u32, reason: &str);
}

/// Identity of the local masternode, when the node is one
#[derive(Debug, Clone)]
pub struct LocalMasternode {
    /// Registration hash
    pub pro_tx_hash: ProTxHash,
    /// Operator secret key
    pub operator_key: SecretKey,
}

/// Late-bound network handle. Set at `start`, cleared at `stop`.
#[derive(Default)]
pub struct NetworkSlot {
    inner: RwLock<Option<Arc<dyn NetworkHandle>>>,
}

impl NetworkSlot {
    /// Install the handle
    pub fn set(&self, network: Arc<dyn NetworkHandle>) {
        *self.inner.write() = Some(network);
    }

    /// Remove the handle
    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// Current handle, if started. The lock is released before the caller uses it.
    pub fn get(&self) -> Option<Arc<dyn NetworkHandle>> {
        self.inner.read().clone()
    }

    /// Broadcast if a network is installed
    pub fn broadcast(&self, msg: LlmqMessage) {
        if let Some(network) = self.get() {
            network.broadcast(msg);
        }
    }

    /// Penalize a peer if a network is installed
    pub fn misbehaving(&self, peer: PeerId, score: u32, reason: &str) {
        if let Some(network) = self.get() {
            network.misbehaving(peer, score, reason);
        }
    }
}
