//! Chain locks signed by the regression quorum

use llmq::chainlocks::{ChainLockOutcome, ChainLockView};
use llmq::{ChainLockSig, ChainView, LlmqMessage};
use llmq_core::{sha256d, PeerId};
use llmq_testkit::{test_config, Simulation};

const SIGNING_HEIGHT: u32 = 43;

fn running_sim(until: u32) -> Simulation {
    let sim = Simulation::builder(test_config())
        .masternodes(3)
        .observers(1)
        .build()
        .unwrap();
    sim.start().unwrap();
    sim.mine_until(until).unwrap();
    sim
}

#[test]
fn test_every_tip_is_chain_locked_once_a_quorum_signs() {
    let sim = running_sim(SIGNING_HEIGHT + 3);
    let tip = sim.tip();

    for node in sim.nodes() {
        let best = node.ctx.chain_locks().best_chain_lock().expect("chain locked");
        assert_eq!(best.height, tip);
        assert_eq!(Some(best.block_hash), sim.chain.block_hash(tip));

        let heights = node.validation.chain_locked_heights();
        assert!(!heights.is_empty());
        assert!(heights.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(heights.last(), Some(&tip));
        assert!(heights.iter().all(|h| *h >= SIGNING_HEIGHT));
    }
    assert!(sim.hub.misbehavior().is_empty());
}

#[test]
fn test_chain_lock_view_reports_locked_and_conflicting_blocks() {
    let sim = running_sim(SIGNING_HEIGHT + 1);
    let view = sim.node(3).ctx.chain_locks();
    let tip = sim.tip();
    let tip_hash = sim.chain.block_hash(tip).unwrap();
    let older = sim.chain.block_hash(tip - 5).unwrap();

    assert!(view.is_block_locked(&tip_hash));
    assert!(view.is_block_locked(&older));
    assert!(!view.is_block_locked(&sha256d(b"unknown")));

    assert!(view.would_conflict_with_lock(tip, &sha256d(b"competing")));
    assert!(view.would_conflict_with_lock(tip - 2, &sha256d(b"competing")));
    assert!(!view.would_conflict_with_lock(tip, &tip_hash));
    assert!(!view.would_conflict_with_lock(tip + 1, &sha256d(b"next")));
}

#[test]
fn test_stale_and_redundant_locks_have_no_effect() {
    let sim = running_sim(SIGNING_HEIGHT + 2);
    let node = sim.node(3);
    let best = node.ctx.chain_locks().best_chain_lock().unwrap();
    let events = node.validation.events().len();

    let stale = ChainLockSig {
        height: best.height - 1,
        block_hash: sim.chain.block_hash(best.height - 1).unwrap(),
        sig: best.sig,
    };
    assert_eq!(
        node.ctx.chain_locks().process_new_chain_lock(stale.clone()),
        ChainLockOutcome::Stale
    );
    assert_eq!(
        node.ctx.chain_locks().process_new_chain_lock(best.clone()),
        ChainLockOutcome::Redundant
    );

    // Gossiped stale locks are dropped before verification.
    node.ctx.process_message(PeerId(50), LlmqMessage::ChainLock(stale));
    sim.settle();

    assert_eq!(node.validation.events().len(), events);
    assert_eq!(node.ctx.chain_locks().best_chain_lock(), Some(best));
    assert!(sim.hub.misbehavior().is_empty());
}

#[test]
fn test_forged_chain_lock_penalizes_sender() {
    let sim = running_sim(SIGNING_HEIGHT + 1);
    let node = sim.node(3);
    let best = node.ctx.chain_locks().best_chain_lock().unwrap();

    let forged = ChainLockSig {
        height: best.height + 1,
        block_hash: sha256d(b"forged"),
        sig: sim.masternodes.get(1).operator_key.sign(&sha256d(b"forged")),
    };
    node.ctx.process_message(PeerId(60), LlmqMessage::ChainLock(forged));
    sim.settle();

    assert_eq!(node.ctx.chain_locks().best_chain_lock(), Some(best));
    assert!(sim
        .hub
        .misbehavior()
        .iter()
        .any(|m| m.reporter == node.peer && m.peer == PeerId(60)));
}

#[test]
fn test_observer_accepts_gossiped_lock_without_signing() {
    let sim = running_sim(SIGNING_HEIGHT);
    let observer = sim.node(3);
    assert!(!observer.ctx.is_masternode());
    assert_eq!(
        observer.ctx.chain_locks().best_chain_lock().map(|b| b.height),
        Some(SIGNING_HEIGHT)
    );
    assert_eq!(observer.ctx.shares().session_count(), 0);
}
