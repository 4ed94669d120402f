//! Proptest strategies for lock inputs

use llmq_core::{Hash32, OutPoint, Transaction};
use proptest::prelude::*;

/// Any 32-byte hash
pub fn arb_hash() -> impl Strategy<Value = Hash32> {
    any::<[u8; 32]>().prop_map(Hash32)
}

/// Outpoint of one of `funding` fixed transactions
pub fn arb_outpoint(funding: u8) -> impl Strategy<Value = OutPoint> {
    (0..funding.max(1), 0u32..4).prop_map(|(t, vout)| OutPoint::new(Hash32([t; 32]), vout))
}

/// Transaction spending one to three outpoints drawn from a small pool,
/// so conflicts are common
pub fn arb_transaction() -> impl Strategy<Value = Transaction> {
    (arb_hash(), proptest::collection::btree_set(arb_outpoint(3), 1..=3))
        .prop_map(|(txid, inputs)| Transaction::new(txid, inputs.into_iter().collect()))
}
