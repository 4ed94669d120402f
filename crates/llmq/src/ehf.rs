//! Upgrade signals
//!
//! Masternodes vote for a fork by asking the upgrade-signal quorum to sign a
//! version bit. Each recovered signal reaches the fork-activation mechanism
//! once.

use crate::interfaces::ForkActivation;
use crate::signing::{RecoveredSig, RecoveredSigListener, SigningCoordinator};
use llmq_core::crypto::Signature;
use llmq_core::{upgrade_signal_request_id, Hash32, Hasher, LlmqConfig, LlmqError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Quorum-signed vote for a version bit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSignal {
    /// Signalled version bit
    pub version_bit: u8,
    /// Message the quorum signed
    pub msg_hash: Hash32,
    /// Quorum that signed
    pub quorum_hash: Hash32,
    /// Recovered quorum signature
    pub sig: Signature,
}

impl UpgradeSignal {
    /// Identity used for de-duplication
    pub fn payload_hash(&self) -> Hash32 {
        let mut h = Hasher::tagged("mnhf-payload");
        h.update(&[self.version_bit])
            .update_hash(&self.msg_hash)
            .update_hash(&self.quorum_hash);
        h.finalize()
    }
}

/// Message signed for a version bit
pub fn signal_msg_hash(version_bit: u8) -> Hash32 {
    let mut h = Hasher::tagged("mnhf-signal");
    h.update(&[version_bit]);
    h.finalize()
}

/// Bounded set of recently seen payload hashes
#[derive(Debug)]
struct RecentSet {
    order: VecDeque<Hash32>,
    seen: HashSet<Hash32>,
    capacity: usize,
}

impl RecentSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Whether `hash` was not already present
    fn insert(&mut self, hash: Hash32) -> bool {
        if !self.seen.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Forwards recovered upgrade signals to fork activation
pub struct UpgradeSignalHandler {
    config: Arc<LlmqConfig>,
    signing: Arc<SigningCoordinator>,
    fork_activation: Arc<dyn ForkActivation>,
    is_masternode: bool,
    bits_by_id: HashMap<Hash32, u8>,
    recent: Mutex<RecentSet>,
}

impl UpgradeSignalHandler {
    /// Create the handler
    pub fn new(
        config: Arc<LlmqConfig>,
        signing: Arc<SigningCoordinator>,
        fork_activation: Arc<dyn ForkActivation>,
        is_masternode: bool,
    ) -> Self {
        let bits_by_id = (0..=u8::MAX)
            .map(|bit| (upgrade_signal_request_id(bit), bit))
            .collect();
        let window = config.upgrade_signal_dedup_window;
        Self {
            config,
            signing,
            fork_activation,
            is_masternode,
            bits_by_id,
            recent: Mutex::new(RecentSet::new(window)),
        }
    }

    /// Ask the upgrade-signal quorum to sign `version_bit`
    pub fn try_sign_signal(&self, version_bit: u8) -> Result<bool> {
        if !self.is_masternode {
            return Err(LlmqError::invalid("only masternodes sign upgrade signals"));
        }
        self.signing.request_signature(
            self.config.upgrade_signal_type,
            upgrade_signal_request_id(version_bit),
            signal_msg_hash(version_bit),
        )
    }

    /// Forward a signal unless it was seen recently
    pub fn process_signal(&self, signal: UpgradeSignal) -> bool {
        if !self.recent.lock().insert(signal.payload_hash()) {
            trace!(bit = signal.version_bit, "duplicate upgrade signal");
            return false;
        }
        info!(
            bit = signal.version_bit,
            quorum = %signal.quorum_hash.short(),
            "upgrade signal recovered"
        );
        self.fork_activation.notify_activation_signal(&signal);
        true
    }
}

impl RecoveredSigListener for UpgradeSignalHandler {
    fn on_recovered(&self, sig: &RecoveredSig) {
        let Some(&version_bit) = self.bits_by_id.get(&sig.id) else {
            debug!(id = %sig.id.short(), "recovered signature is not an upgrade signal");
            return;
        };
        if sig.msg_hash != signal_msg_hash(version_bit) {
            debug!(bit = version_bit, "upgrade signal over unexpected message");
            return;
        }
        self.process_signal(UpgradeSignal {
            version_bit,
            msg_hash: sig.msg_hash,
            quorum_hash: sig.quorum_hash,
            sig: sig.sig,
        });
    }
}

impl std::fmt::Debug for UpgradeSignalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeSignalHandler")
            .field("recent", &self.recent.lock().order.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_set_forgets_oldest() {
        let mut recent = RecentSet::new(2);
        let (a, b, c) = (Hash32([1; 32]), Hash32([2; 32]), Hash32([3; 32]));
        assert!(recent.insert(a));
        assert!(!recent.insert(a));
        assert!(recent.insert(b));
        assert!(recent.insert(c));
        assert!(recent.insert(a));
        assert!(!recent.insert(c));
    }

    #[test]
    fn test_signal_messages_differ_per_bit() {
        assert_ne!(signal_msg_hash(1), signal_msg_hash(2));
        assert_ne!(signal_msg_hash(1), upgrade_signal_request_id(1));
    }
}
