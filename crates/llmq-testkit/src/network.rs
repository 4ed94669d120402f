//! Loopback transport between in-process contexts
//!
//! Every message goes through the wire encoding and is handed to the
//! recipient's `process_message` on the sender's thread. Contexts only queue
//! inbound work, so delivery never re-enters the sender.

use llmq::{LlmqContext, LlmqMessage, NetworkHandle};
use llmq_core::PeerId;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Decides whether a message from one peer to another is lost
pub type DropRule = Box<dyn Fn(PeerId, PeerId, &LlmqMessage) -> bool + Send + Sync>;

/// A misbehavior report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Misbehavior {
    /// Node that reported
    pub reporter: PeerId,
    /// Offending peer
    pub peer: PeerId,
    /// Penalty
    pub score: u32,
    /// Reason given
    pub reason: String,
}

/// Registry of the simulated peers
#[derive(Default)]
pub struct LoopbackHub {
    nodes: RwLock<BTreeMap<PeerId, Weak<LlmqContext>>>,
    drop_rule: RwLock<Option<DropRule>>,
    misbehavior: Mutex<Vec<Misbehavior>>,
    delivered: AtomicUsize,
}

impl LoopbackHub {
    /// Empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `ctx` reachable as `peer`
    pub fn register(&self, peer: PeerId, ctx: &Arc<LlmqContext>) {
        self.nodes.write().insert(peer, Arc::downgrade(ctx));
    }

    /// Network handle for the node registered as `peer`
    pub fn handle(self: &Arc<Self>, peer: PeerId) -> Arc<LoopbackNetwork> {
        Arc::new(LoopbackNetwork {
            hub: Arc::clone(self),
            peer,
        })
    }

    /// Lose every message for which `rule` returns true
    pub fn set_drop_rule(&self, rule: impl Fn(PeerId, PeerId, &LlmqMessage) -> bool + Send + Sync + 'static) {
        *self.drop_rule.write() = Some(Box::new(rule));
    }

    /// Deliver everything again
    pub fn clear_drop_rule(&self) {
        *self.drop_rule.write() = None;
    }

    /// Reports received so far
    pub fn misbehavior(&self) -> Vec<Misbehavior> {
        self.misbehavior.lock().clone()
    }

    /// Messages delivered so far
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    fn peers(&self) -> Vec<PeerId> {
        self.nodes.read().keys().copied().collect()
    }

    fn deliver(&self, from: PeerId, to: PeerId, msg: &LlmqMessage) {
        if let Some(rule) = self.drop_rule.read().as_ref() {
            if rule(from, to, msg) {
                return;
            }
        }
        let decoded = match msg.encode().and_then(|bytes| LlmqMessage::decode(&bytes)) {
            Ok(m) => m,
            Err(e) => {
                warn!(%from, %to, kind = msg.kind(), error = %e, "wire round trip failed");
                return;
            }
        };
        let target = self.nodes.read().get(&to).and_then(Weak::upgrade);
        if let Some(ctx) = target {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            ctx.process_message(from, decoded);
        }
    }
}

/// One node's view of the hub
pub struct LoopbackNetwork {
    hub: Arc<LoopbackHub>,
    peer: PeerId,
}

impl NetworkHandle for LoopbackNetwork {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn broadcast(&self, msg: LlmqMessage) {
        for to in self.hub.peers().into_iter().filter(|p| *p != self.peer) {
            self.hub.deliver(self.peer, to, &msg);
        }
    }

    fn send_to(&self, peer: PeerId, msg: LlmqMessage) {
        if peer != self.peer {
            self.hub.deliver(self.peer, peer, &msg);
        }
    }

    fn misbehaving(&self, peer: PeerId, score: u32, reason: &str) {
        self.hub.misbehavior.lock().push(Misbehavior {
            reporter: self.peer,
            peer,
            score,
            reason: reason.to_string(),
        });
    }
}
