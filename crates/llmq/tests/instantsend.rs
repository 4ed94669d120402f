//! Instant locks and their interaction with chain locks

use assert_matches::assert_matches;
use llmq::{LlmqError, RecoveredSig};
use llmq_core::crypto::{recover_signature, MemberId, Signature};
use llmq_core::{build_sign_hash, instant_lock_request_id, sha256d, OutPoint, PeerId, Transaction};
use llmq_testkit::{test_config, Simulation};

const SIGNING_HEIGHT: u32 = 43;

fn running_sim() -> Simulation {
    let sim = Simulation::builder(test_config())
        .masternodes(3)
        .observers(1)
        .build()
        .unwrap();
    sim.start().unwrap();
    sim.mine_until(SIGNING_HEIGHT + 1).unwrap();
    sim
}

fn spend(tag: &[u8], inputs: &[OutPoint]) -> Transaction {
    Transaction::new(sha256d(tag), inputs.to_vec())
}

fn submit(sim: &Simulation, tx: &Transaction) {
    for node in sim.nodes() {
        node.ctx.transaction_added(tx).unwrap();
    }
    sim.settle();
}

#[test]
fn test_transaction_is_locked_everywhere() {
    let sim = running_sim();
    let funding = OutPoint::new(sha256d(b"funding"), 0);
    let tx = spend(b"tx", &[funding]);
    submit(&sim, &tx);

    for node in sim.nodes() {
        let lock = node.ctx.instant_locks().get_lock(&tx.txid).expect("locked");
        assert_eq!(lock.inputs, tx.inputs);
        assert!(node.validation.was_accepted(&tx.txid));
    }
}

#[test]
fn test_conflicting_transaction_is_rejected() {
    let sim = running_sim();
    let funding = OutPoint::new(sha256d(b"funding"), 0);
    let tx = spend(b"tx", &[funding]);
    submit(&sim, &tx);

    let double_spend = spend(b"double-spend", &[funding, OutPoint::new(sha256d(b"other"), 1)]);
    for node in sim.nodes() {
        assert_eq!(
            node.ctx.instant_locks().conflicting_lock(&double_spend).map(|l| l.txid),
            Some(tx.txid)
        );
        assert_matches!(
            node.ctx.transaction_added(&double_spend),
            Err(LlmqError::Conflict { .. })
        );
    }
    sim.settle();
    assert!(!sim.node(0).ctx.instant_locks().is_locked(&double_spend.txid));
}

#[test]
fn test_chain_lock_retracts_conflicting_instant_lock() {
    let sim = running_sim();
    let funding = OutPoint::new(sha256d(b"funding"), 0);
    let locked = spend(b"locked", &[funding]);
    submit(&sim, &locked);
    assert!(sim.node(3).ctx.instant_locks().is_locked(&locked.txid));

    // A miner includes a different spend of the same input; the chain lock wins.
    let mined = spend(b"mined-double-spend", &[funding]);
    let block = sim.mine_block(vec![mined]).unwrap();

    for node in sim.nodes() {
        assert_eq!(
            node.ctx.chain_locks().best_chain_lock().map(|b| b.height),
            Some(block.height)
        );
        assert!(!node.ctx.instant_locks().is_locked(&locked.txid));
        assert!(node.validation.was_retracted(&locked.txid));
    }
}

#[test]
fn test_chain_locked_transaction_is_archived() {
    let sim = running_sim();
    let tx = spend(b"archived", &[OutPoint::new(sha256d(b"funding"), 3)]);
    submit(&sim, &tx);

    sim.mine_block(vec![tx.clone()]).unwrap();

    for node in sim.nodes() {
        let locks = node.ctx.instant_locks();
        assert!(!locks.is_locked(&tx.txid));
        assert!(locks.is_archived(&tx.txid));
        assert!(!node.validation.was_retracted(&tx.txid));
    }
}

#[test]
fn test_transaction_without_inputs_is_invalid() {
    let sim = running_sim();
    let err = sim
        .node(0)
        .ctx
        .transaction_added(&Transaction::new(sha256d(b"empty"), Vec::new()))
        .unwrap_err();
    assert_matches!(err, LlmqError::Invalid { .. });
}

#[test]
fn test_mempool_double_spend_does_not_displace_first_candidate() {
    let sim = running_sim();
    let llmq_type = test_config().instant_send_type;
    let funding = OutPoint::new(sha256d(b"funding"), 7);
    let first = spend(b"first", &[funding]);
    let second = spend(b"second", &[funding]);
    sim.hub.set_drop_rule(|_, _, _| true);

    let node = sim.node(0);
    assert!(node.ctx.transaction_added(&first).unwrap());
    assert!(!node.ctx.transaction_added(&second).unwrap());
    sim.settle();
    assert_eq!(node.ctx.instant_locks().pending_count(), 2);

    // Two members recover the signature over the first spend out of band.
    let id = instant_lock_request_id(&first.inputs);
    let quorum = node.ctx.registry().active_quorums(llmq_type)[0].clone();
    let sign_hash = build_sign_hash(llmq_type, &quorum.quorum_hash, &id, &first.txid);
    let shares: Vec<(MemberId, Signature)> = (0..2)
        .map(|i| {
            let me = sim.masternodes.get(i).entry.pro_tx_hash;
            let local = sim
                .node(i)
                .ctx
                .registry()
                .lookup(llmq_type, &quorum.quorum_hash)
                .unwrap();
            let index = local.member_index(&me).unwrap();
            (
                local.member_id(index).unwrap(),
                local.secret_share().unwrap().sign(&sign_hash),
            )
        })
        .collect();
    let sig = RecoveredSig {
        llmq_type,
        quorum_hash: quorum.quorum_hash,
        id,
        msg_hash: first.txid,
        sig: recover_signature(&shares, quorum.threshold()).unwrap(),
    };
    node.ctx.signing().process_message(PeerId(9), sig);
    sim.settle();

    let locks = node.ctx.instant_locks();
    assert!(locks.is_locked(&first.txid));
    assert!(!locks.is_locked(&second.txid));
    assert_eq!(locks.pending_count(), 0);
    assert!(node.validation.was_accepted(&first.txid));
}
