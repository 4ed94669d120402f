//! Several nodes on one chain and one loopback hub

use crate::chain::MockChain;
use crate::masternodes::TestMasternodeList;
use crate::network::LoopbackHub;
use crate::recorders::{RecordingForkActivation, RecordingValidation};
use llmq::{Block, ChainView, LlmqContext, LlmqDependencies};
use llmq_core::{BlockHeight, LlmqConfig, PeerId, Result, Transaction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Polls `settle` waits for
const QUIET_POLLS: usize = 3;
const POLL_INTERVAL: Duration = Duration::from_millis(3);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(20);

/// One simulated node
pub struct SimNode {
    /// Transport identity
    pub peer: PeerId,
    /// The node's subsystem
    pub ctx: Arc<LlmqContext>,
    /// Validation callbacks the node made
    pub validation: Arc<RecordingValidation>,
    /// Activation signals the node forwarded
    pub fork_activation: Arc<RecordingForkActivation>,
}

/// Builder for `Simulation`
pub struct SimulationBuilder {
    config: LlmqConfig,
    masternodes: usize,
    observers: usize,
    overrides: HashMap<usize, LlmqConfig>,
}

impl SimulationBuilder {
    /// Number of masternode nodes; they come first
    pub fn masternodes(mut self, count: usize) -> Self {
        self.masternodes = count;
        self
    }

    /// Number of regular nodes after the masternodes
    pub fn observers(mut self, count: usize) -> Self {
        self.observers = count;
        self
    }

    /// Use a different configuration for one node, e.g. to inject DKG faults
    pub fn node_config(mut self, index: usize, config: LlmqConfig) -> Self {
        self.overrides.insert(index, config);
        self
    }

    /// Construct every context; nothing is started
    pub fn build(self) -> Result<Simulation> {
        crate::init_test_tracing();
        let chain = Arc::new(MockChain::new());
        let masternodes = Arc::new(TestMasternodeList::generate(self.masternodes));
        let hub = LoopbackHub::new();
        let mut nodes = Vec::with_capacity(self.masternodes + self.observers);
        for i in 0..self.masternodes + self.observers {
            let peer = PeerId(i as u64 + 1);
            let validation = Arc::new(RecordingValidation::default());
            let fork_activation = Arc::new(RecordingForkActivation::default());
            let config = self
                .overrides
                .get(&i)
                .cloned()
                .unwrap_or_else(|| self.config.clone());
            let ctx = Arc::new(LlmqContext::new(
                config,
                LlmqDependencies {
                    chain: Arc::clone(&chain) as _,
                    masternodes: Arc::clone(&masternodes) as _,
                    validation: Arc::clone(&validation) as _,
                    fork_activation: Arc::clone(&fork_activation) as _,
                    local: (i < self.masternodes).then(|| masternodes.get(i).local()),
                },
            )?);
            hub.register(peer, &ctx);
            nodes.push(SimNode {
                peer,
                ctx,
                validation,
                fork_activation,
            });
        }
        Ok(Simulation {
            chain,
            masternodes,
            hub,
            nodes,
            blocks: Mutex::new(Vec::new()),
        })
    }
}

/// Nodes sharing one chain and one hub
pub struct Simulation {
    /// The shared chain
    pub chain: Arc<MockChain>,
    /// The shared masternode list
    pub masternodes: Arc<TestMasternodeList>,
    /// The shared transport
    pub hub: Arc<LoopbackHub>,
    nodes: Vec<SimNode>,
    blocks: Mutex<Vec<Block>>,
}

impl Simulation {
    /// Start configuring a simulation
    pub fn builder(config: LlmqConfig) -> SimulationBuilder {
        SimulationBuilder {
            config,
            masternodes: 0,
            observers: 0,
            overrides: HashMap::new(),
        }
    }

    /// Node by index
    pub fn node(&self, index: usize) -> &SimNode {
        &self.nodes[index]
    }

    /// All nodes
    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Start every context on its hub handle
    pub fn start(&self) -> Result<()> {
        for node in &self.nodes {
            node.ctx.start(self.hub.handle(node.peer))?;
        }
        Ok(())
    }

    /// Interrupt, then stop, every context
    pub fn stop(&self) -> Result<()> {
        for node in &self.nodes {
            node.ctx.interrupt()?;
        }
        for node in &self.nodes {
            node.ctx.stop()?;
        }
        Ok(())
    }

    /// Current tip height
    pub fn tip(&self) -> BlockHeight {
        self.chain.tip_height()
    }

    /// Mine a block carrying `transactions` and the first node's pending
    /// commitments, connect it everywhere and let the network settle
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block> {
        let height = self.tip() + 1;
        let commitments = self
            .nodes
            .first()
            .map(|n| n.ctx.ledger().pending_for_block(height))
            .unwrap_or_default();
        let (mined_height, hash, prev_hash) = self.chain.append();
        debug_assert_eq!(mined_height, height);
        let block = Block {
            height,
            hash,
            prev_hash,
            transactions,
            commitments,
        };
        for node in &self.nodes {
            node.ctx.block_connected(&block)?;
        }
        self.blocks.lock().push(block.clone());
        self.settle();
        Ok(block)
    }

    /// Mine empty blocks until the tip reaches `height`
    pub fn mine_until(&self, height: BlockHeight) -> Result<()> {
        while self.tip() < height {
            self.mine_block(Vec::new())?;
        }
        Ok(())
    }

    /// Disconnect the tip everywhere
    pub fn disconnect_tip(&self) -> Option<Block> {
        let block = self.blocks.lock().pop()?;
        self.chain.pop();
        for node in &self.nodes {
            node.ctx.block_disconnected(&block);
        }
        self.settle();
        Some(block)
    }

    /// Wait until every node has been idle for several consecutive polls.
    /// Returns false on timeout.
    pub fn settle(&self) -> bool {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        let mut quiet = 0;
        while quiet < QUIET_POLLS {
            if Instant::now() > deadline {
                warn!("simulation did not settle");
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
            if self.nodes.iter().all(|n| n.ctx.is_idle()) {
                quiet += 1;
            } else {
                quiet = 0;
            }
        }
        debug!(tip = self.tip(), delivered = self.hub.delivered(), "settled");
        true
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        for node in &self.nodes {
            let _ = node.ctx.interrupt();
            let _ = node.ctx.stop();
        }
    }
}
