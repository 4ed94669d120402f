//! The LLMQ context: owns every component and drives their lifecycle
//!
//! Construction happens in two steps. Components are built with their
//! downward dependencies only; `wire` then installs the back-references
//! (share sink, recovered-signature listeners, chain-lock listeners).
//! `destroy` removes those references again so no reference cycle outlives
//! the context.
//!
//! ```text
//! new ──► start(network) ──► interrupt ──► stop ──► destroy
//! ```
//!
//! Start order: DKG (masternodes only), share exchange, signing coordinator,
//! chain locks, instant locks. Stop order is the exact reverse. The BLS pool
//! runs from construction to destruction.

use crate::bls_worker::BlsWorker;
use crate::chainlocks::{ChainLockHandler, ChainLockListener};
use crate::commitment::CommitmentLedger;
use crate::dkg::{DkgCoordinator, KeyShareStore};
use crate::ehf::UpgradeSignalHandler;
use crate::instantsend::InstantLockHandler;
use crate::interfaces::{
    Block, ChainView, ForkActivation, LocalMasternode, MasternodeList, NetworkHandle,
    ValidationEngine,
};
use crate::messages::LlmqMessage;
use crate::quorums::QuorumRegistry;
use crate::shares::ShareExchange;
use crate::signing::{RecoveredSigListener, ShareSink, SigningCoordinator};
use llmq_core::{LlmqConfig, LlmqError, PeerId, Result, Transaction};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// External collaborators handed to the context
pub struct LlmqDependencies {
    /// Active chain
    pub chain: Arc<dyn ChainView>,
    /// Committee selection
    pub masternodes: Arc<dyn MasternodeList>,
    /// Block and mempool validation callbacks
    pub validation: Arc<dyn ValidationEngine>,
    /// Fork activation
    pub fork_activation: Arc<dyn ForkActivation>,
    /// Local masternode identity; `None` on regular nodes
    pub local: Option<LocalMasternode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Interrupted,
    Stopped,
    Destroyed,
}

/// Owner of the subsystem's components
pub struct LlmqContext {
    config: Arc<LlmqConfig>,
    is_masternode: bool,
    bls: Arc<BlsWorker>,
    key_shares: Arc<KeyShareStore>,
    ledger: Arc<CommitmentLedger>,
    registry: Arc<QuorumRegistry>,
    dkg: Arc<DkgCoordinator>,
    signing: Arc<SigningCoordinator>,
    shares: Arc<ShareExchange>,
    chain_locks: Arc<ChainLockHandler>,
    instant_locks: Arc<InstantLockHandler>,
    upgrade_signals: Arc<UpgradeSignalHandler>,
    lifecycle: Mutex<Lifecycle>,
}

impl LlmqContext {
    /// Validate the configuration, build and wire every component, and start
    /// the BLS pool
    pub fn new(config: LlmqConfig, deps: LlmqDependencies) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let is_masternode = deps.local.is_some();

        let bls = Arc::new(BlsWorker::new(config.bls_worker_threads));
        let key_shares = Arc::new(KeyShareStore::new());
        let ledger = Arc::new(CommitmentLedger::new(
            Arc::clone(&config),
            Arc::clone(&deps.chain),
            Arc::clone(&deps.masternodes),
        ));
        let registry = Arc::new(QuorumRegistry::new(
            Arc::clone(&config),
            Arc::clone(&deps.masternodes),
            Arc::clone(&key_shares),
        ));
        let dkg = Arc::new(DkgCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&deps.masternodes),
            deps.local.clone(),
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&key_shares),
        ));
        let signing = Arc::new(SigningCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&bls),
            deps.local.clone(),
        ));
        let shares = Arc::new(ShareExchange::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&signing),
            Arc::clone(&bls),
            deps.local,
        ));
        let chain_locks = Arc::new(ChainLockHandler::new(
            Arc::clone(&config),
            deps.chain,
            Arc::clone(&signing),
            Arc::clone(&deps.validation),
            is_masternode,
        ));
        let instant_locks = Arc::new(InstantLockHandler::new(
            Arc::clone(&config),
            Arc::clone(&signing),
            deps.validation,
            is_masternode,
        ));
        let upgrade_signals = Arc::new(UpgradeSignalHandler::new(
            Arc::clone(&config),
            Arc::clone(&signing),
            deps.fork_activation,
            is_masternode,
        ));

        let ctx = Self {
            config,
            is_masternode,
            bls,
            key_shares,
            ledger,
            registry,
            dkg,
            signing,
            shares,
            chain_locks,
            instant_locks,
            upgrade_signals,
            lifecycle: Mutex::new(Lifecycle::Created),
        };
        ctx.bls.start()?;
        ctx.wire();
        debug!(masternode = is_masternode, "llmq context constructed");
        Ok(ctx)
    }

    fn wire(&self) {
        let shares_sink: Arc<dyn ShareSink> = Arc::clone(&self.shares) as Arc<dyn ShareSink>;
        self.signing.set_share_sink(shares_sink);

        let shares: Arc<dyn RecoveredSigListener> = Arc::clone(&self.shares) as _;
        for params in &self.config.params {
            self.signing
                .register_listener(params.llmq_type, Arc::clone(&shares));
        }
        self.signing.register_listener(
            self.config.chain_locks_type,
            Arc::clone(&self.chain_locks) as Arc<dyn RecoveredSigListener>,
        );
        self.signing.register_listener(
            self.config.instant_send_type,
            Arc::clone(&self.instant_locks) as Arc<dyn RecoveredSigListener>,
        );
        self.signing.register_listener(
            self.config.upgrade_signal_type,
            Arc::clone(&self.upgrade_signals) as Arc<dyn RecoveredSigListener>,
        );
        self.chain_locks
            .register_listener(Arc::clone(&self.instant_locks) as Arc<dyn ChainLockListener>);
    }

    /// Start every worker. A context starts once; if any worker fails to
    /// start, the ones already running are stopped again.
    pub fn start(&self, network: Arc<dyn NetworkHandle>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle != Lifecycle::Created {
            return Err(LlmqError::invariant(format!(
                "llmq context started while {lifecycle:?}"
            )));
        }
        if let Err(e) = self.start_components(network) {
            warn!(error = %e, "llmq context failed to start");
            self.stop_components();
            *lifecycle = Lifecycle::Stopped;
            return Err(e);
        }
        *lifecycle = Lifecycle::Running;
        info!(masternode = self.is_masternode, "llmq context started");
        Ok(())
    }

    fn start_components(&self, network: Arc<dyn NetworkHandle>) -> Result<()> {
        if self.is_masternode {
            self.dkg.start(Arc::clone(&network))?;
        }
        self.shares.start(Arc::clone(&network))?;
        self.signing.start(Arc::clone(&network))?;
        self.chain_locks.start(Arc::clone(&network))?;
        self.instant_locks.start(network)
    }

    /// Ask every worker to exit. Safe to call more than once.
    pub fn interrupt(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running => {
                self.instant_locks.interrupt();
                self.chain_locks.interrupt();
                self.signing.interrupt();
                self.shares.interrupt();
                self.dkg.interrupt();
                *lifecycle = Lifecycle::Interrupted;
                debug!("llmq context interrupted");
                Ok(())
            }
            Lifecycle::Interrupted | Lifecycle::Stopped => Ok(()),
            other => Err(LlmqError::invariant(format!(
                "llmq context interrupted while {other:?}"
            ))),
        }
    }

    /// Join every worker, in reverse start order
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running | Lifecycle::Interrupted => {
                self.stop_components();
                *lifecycle = Lifecycle::Stopped;
                info!("llmq context stopped");
                Ok(())
            }
            Lifecycle::Stopped => Ok(()),
            other => Err(LlmqError::invariant(format!(
                "llmq context stopped while {other:?}"
            ))),
        }
    }

    fn stop_components(&self) {
        self.instant_locks.stop();
        self.chain_locks.stop();
        self.signing.stop();
        self.shares.stop();
        self.dkg.stop();
    }

    /// Tear down the wiring and the BLS pool. Stops the workers if needed.
    pub fn destroy(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Destroyed {
            return;
        }
        if matches!(*lifecycle, Lifecycle::Running | Lifecycle::Interrupted) {
            warn!("llmq context destroyed without stop");
            self.stop_components();
        }
        self.signing.clear_wiring();
        self.chain_locks.clear_listeners();
        self.bls.stop();
        *lifecycle = Lifecycle::Destroyed;
        debug!("llmq context destroyed");
    }

    /// Feed a newly connected block to every component, in order.
    ///
    /// Fails, with nothing recorded, when the block carries an invalid
    /// commitment.
    pub fn block_connected(&self, block: &Block) -> Result<()> {
        let mined = self.ledger.process_block(block)?;
        self.registry.block_connected(block.height, &mined);
        self.signing.tick(block.height);
        self.shares.tick(block.height);
        self.dkg.tick(block.height, block.hash);
        self.instant_locks.block_connected(block);
        self.chain_locks.update_tip(block.height, block.hash);
        Ok(())
    }

    /// Undo a disconnected block
    pub fn block_disconnected(&self, block: &Block) {
        let unmined = self.ledger.undo_block(block);
        self.registry.block_disconnected(block.height, &unmined);
        self.instant_locks.block_disconnected(block);
    }

    /// A transaction entered the mempool; see `InstantLockHandler::process_transaction`
    pub fn transaction_added(&self, tx: &Transaction) -> Result<bool> {
        self.instant_locks.process_transaction(tx)
    }

    /// Route a message from a peer to its component
    pub fn process_message(&self, from: PeerId, msg: LlmqMessage) {
        match msg {
            LlmqMessage::Dkg(m) => self.dkg.process_message(from, m),
            LlmqMessage::FinalCommitment(c) => self.dkg.process_final_commitment(from, c),
            LlmqMessage::SigShare(s) => self.shares.process_message(from, s),
            LlmqMessage::RecoveredSig(s) => self.signing.process_message(from, s),
            LlmqMessage::ChainLock(c) => self.chain_locks.process_message(from, c),
            LlmqMessage::InstantLock(l) => self.instant_locks.process_message(from, l),
        }
    }

    /// Whether no worker has queued work
    pub fn is_idle(&self) -> bool {
        self.dkg.is_idle()
            && self.shares.is_idle()
            && self.signing.is_idle()
            && self.chain_locks.is_idle()
            && self.instant_locks.is_idle()
    }

    /// Whether the node is a masternode
    pub fn is_masternode(&self) -> bool {
        self.is_masternode
    }

    /// Configuration in effect
    pub fn config(&self) -> &Arc<LlmqConfig> {
        &self.config
    }

    /// Commitment ledger
    pub fn ledger(&self) -> &Arc<CommitmentLedger> {
        &self.ledger
    }

    /// Quorum registry
    pub fn registry(&self) -> &Arc<QuorumRegistry> {
        &self.registry
    }

    /// Local key shares
    pub fn key_shares(&self) -> &Arc<KeyShareStore> {
        &self.key_shares
    }

    /// DKG coordinator
    pub fn dkg(&self) -> &Arc<DkgCoordinator> {
        &self.dkg
    }

    /// Signing coordinator
    pub fn signing(&self) -> &Arc<SigningCoordinator> {
        &self.signing
    }

    /// Share exchange
    pub fn shares(&self) -> &Arc<ShareExchange> {
        &self.shares
    }

    /// Chain-lock handler
    pub fn chain_locks(&self) -> &Arc<ChainLockHandler> {
        &self.chain_locks
    }

    /// Instant-lock handler
    pub fn instant_locks(&self) -> &Arc<InstantLockHandler> {
        &self.instant_locks
    }

    /// Upgrade-signal handler
    pub fn upgrade_signals(&self) -> &Arc<UpgradeSignalHandler> {
        &self.upgrade_signals
    }
}

impl Drop for LlmqContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for LlmqContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmqContext")
            .field("masternode", &self.is_masternode)
            .field("lifecycle", &*self.lifecycle.lock())
            .finish()
    }
}
