//! Validation and fork-activation hooks that record what they are told

use llmq::{ForkActivation, UpgradeSignal, ValidationEngine};
use llmq_core::{BlockHeight, Hash32};
use parking_lot::Mutex;

/// A validation callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationEvent {
    /// `enforce_chain_lock`
    ChainLockEnforced {
        /// Locked height
        height: BlockHeight,
        /// Locked block
        block_hash: Hash32,
    },
    /// `instant_lock_accepted`
    InstantLockAccepted(Hash32),
    /// `instant_lock_retracted`
    InstantLockRetracted(Hash32),
}

/// Records validation callbacks in order
#[derive(Debug, Default)]
pub struct RecordingValidation {
    events: Mutex<Vec<ValidationEvent>>,
}

impl RecordingValidation {
    /// All callbacks so far
    pub fn events(&self) -> Vec<ValidationEvent> {
        self.events.lock().clone()
    }

    /// Heights of enforced chain locks, in order
    pub fn chain_locked_heights(&self) -> Vec<BlockHeight> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ValidationEvent::ChainLockEnforced { height, .. } => Some(*height),
                _ => None,
            })
            .collect()
    }

    /// Whether `txid` was reported instant-locked
    pub fn was_accepted(&self, txid: &Hash32) -> bool {
        self.events
            .lock()
            .contains(&ValidationEvent::InstantLockAccepted(*txid))
    }

    /// Whether `txid`'s lock was reported retracted
    pub fn was_retracted(&self, txid: &Hash32) -> bool {
        self.events
            .lock()
            .contains(&ValidationEvent::InstantLockRetracted(*txid))
    }
}

impl ValidationEngine for RecordingValidation {
    fn enforce_chain_lock(&self, height: BlockHeight, block_hash: &Hash32) {
        self.events.lock().push(ValidationEvent::ChainLockEnforced {
            height,
            block_hash: *block_hash,
        });
    }

    fn instant_lock_accepted(&self, txid: &Hash32) {
        self.events
            .lock()
            .push(ValidationEvent::InstantLockAccepted(*txid));
    }

    fn instant_lock_retracted(&self, txid: &Hash32) {
        self.events
            .lock()
            .push(ValidationEvent::InstantLockRetracted(*txid));
    }
}

/// Records activation signals
#[derive(Debug, Default)]
pub struct RecordingForkActivation {
    signals: Mutex<Vec<UpgradeSignal>>,
}

impl RecordingForkActivation {
    /// Signals received so far
    pub fn signals(&self) -> Vec<UpgradeSignal> {
        self.signals.lock().clone()
    }
}

impl ForkActivation for RecordingForkActivation {
    fn notify_activation_signal(&self, signal: &UpgradeSignal) {
        self.signals.lock().push(signal.clone());
    }
}
