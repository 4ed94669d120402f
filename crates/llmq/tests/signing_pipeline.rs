//! Signing requests through share exchange, recovery and gossip

use assert_matches::assert_matches;
use llmq::{LlmqMessage, RecoveredLookup, RecoveredSig, RecoveredSigListener, RequestState};
use llmq_core::crypto::{recover_signature, MemberId, Signature};
use llmq_core::{build_sign_hash, sha256d, Hash32, LlmqError, PeerId};
use llmq_testkit::{test_config, test_params, Simulation};
use parking_lot::Mutex;
use std::sync::Arc;

/// First height at which the quorum mined at 35 can be selected
const SIGNING_HEIGHT: u32 = 43;

#[derive(Default)]
struct Recorder {
    id: Hash32,
    recovered: Mutex<Vec<RecoveredSig>>,
    conflicts: Mutex<Vec<(RecoveredSig, RecoveredSig)>>,
}

impl RecoveredSigListener for Recorder {
    fn on_recovered(&self, sig: &RecoveredSig) {
        if sig.id == self.id {
            self.recovered.lock().push(sig.clone());
        }
    }

    fn on_conflict(&self, existing: &RecoveredSig, conflicting: &RecoveredSig) {
        if existing.id == self.id {
            self.conflicts
                .lock()
                .push((existing.clone(), conflicting.clone()));
        }
    }
}

fn running_sim() -> Simulation {
    let sim = Simulation::builder(test_config())
        .masternodes(3)
        .observers(1)
        .build()
        .unwrap();
    sim.start().unwrap();
    sim.mine_until(SIGNING_HEIGHT).unwrap();
    sim
}

fn recorder(sim: &Simulation, node: usize, id: Hash32) -> Arc<Recorder> {
    let recorder = Arc::new(Recorder {
        id,
        ..Default::default()
    });
    sim.node(node)
        .ctx
        .signing()
        .register_listener(test_params().llmq_type, Arc::clone(&recorder) as _);
    recorder
}

#[test]
fn test_request_recovers_on_every_node() {
    let sim = running_sim();
    let llmq_type = test_params().llmq_type;
    let id = sha256d(b"request-id");
    let msg = sha256d(b"message");
    let observed = recorder(&sim, 3, id);

    for node in &sim.nodes()[..3] {
        assert!(node.ctx.signing().request_signature(llmq_type, id, msg).unwrap());
    }
    sim.settle();

    for node in sim.nodes() {
        let sig = assert_matches!(
            node.ctx.signing().try_get_recovered(llmq_type, &id),
            RecoveredLookup::Recovered(sig) => sig
        );
        assert_eq!(sig.msg_hash, msg);
        assert!(node
            .ctx
            .signing()
            .verify_with_quorum(llmq_type, &sig.quorum_hash, &id, &msg, &sig.sig)
            .unwrap());
        assert!(node.ctx.signing().has_recovered(llmq_type, &id, &msg));
        assert!(!node.ctx.signing().is_outstanding(llmq_type, &id));
    }
    assert_eq!(observed.recovered.lock().len(), 1);

    let sign_hash = build_sign_hash(llmq_type, &observed.recovered.lock()[0].quorum_hash, &id, &msg);
    assert_eq!(sim.node(0).ctx.shares().request_state(&sign_hash), RequestState::Recovered);
}

#[test]
fn test_duplicate_recovered_signature_is_a_no_op() {
    let sim = running_sim();
    let llmq_type = test_params().llmq_type;
    let id = sha256d(b"dup-id");
    let msg = sha256d(b"dup-message");
    let observed = recorder(&sim, 3, id);

    for node in &sim.nodes()[..3] {
        node.ctx.signing().request_signature(llmq_type, id, msg).unwrap();
    }
    sim.settle();
    let sig = observed.recovered.lock()[0].clone();

    sim.node(3).ctx.signing().process_message(PeerId(1), sig.clone());
    sim.node(3).ctx.signing().process_message(PeerId(2), sig);
    sim.settle();

    assert_eq!(observed.recovered.lock().len(), 1);
    assert!(observed.conflicts.lock().is_empty());
    assert!(sim.hub.misbehavior().is_empty());
}

#[test]
fn test_second_message_for_same_id_is_refused() {
    let sim = running_sim();
    let llmq_type = test_params().llmq_type;
    let id = sha256d(b"vote-id");
    let signing = sim.node(0).ctx.signing();

    assert!(signing.request_signature(llmq_type, id, sha256d(b"first")).unwrap());
    assert!(signing.request_signature(llmq_type, id, sha256d(b"first")).unwrap());
    assert!(!signing.request_signature(llmq_type, id, sha256d(b"second")).unwrap());
}

#[test]
fn test_conflicting_recovery_reports_both_candidates() {
    let sim = running_sim();
    let llmq_type = test_params().llmq_type;
    let id = sha256d(b"conflict-id");
    let first = sha256d(b"first-message");
    let second = sha256d(b"second-message");
    let observed = recorder(&sim, 3, id);

    for node in &sim.nodes()[..3] {
        node.ctx.signing().request_signature(llmq_type, id, first).unwrap();
    }
    sim.settle();
    let recovered = observed.recovered.lock()[0].clone();

    // Two members sign the other message directly with their key shares.
    let quorum = sim
        .node(0)
        .ctx
        .registry()
        .lookup(llmq_type, &recovered.quorum_hash)
        .unwrap();
    let sign_hash = build_sign_hash(llmq_type, &quorum.quorum_hash, &id, &second);
    let shares: Vec<(MemberId, Signature)> = (0..2)
        .map(|i| {
            let node = sim.node(i);
            let me = sim.masternodes.get(i).entry.pro_tx_hash;
            let local = node.ctx.registry().lookup(llmq_type, &quorum.quorum_hash).unwrap();
            let index = local.member_index(&me).unwrap();
            (
                local.member_id(index).unwrap(),
                local.secret_share().unwrap().sign(&sign_hash),
            )
        })
        .collect();
    let forged = RecoveredSig {
        llmq_type,
        quorum_hash: quorum.quorum_hash,
        id,
        msg_hash: second,
        sig: recover_signature(&shares, quorum.threshold()).unwrap(),
    };
    sim.node(3).ctx.signing().process_message(PeerId(1), forged);
    sim.settle();

    let conflicts = observed.conflicts.lock().clone();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].0.msg_hash, first);
    assert_eq!(conflicts[0].1.msg_hash, second);
    let candidates = assert_matches!(
        sim.node(3).ctx.signing().try_get_recovered(llmq_type, &id),
        RecoveredLookup::Conflicting(c) => c
    );
    assert_eq!(candidates.len(), 2);
}

#[test]
fn test_invalid_recovered_signature_penalizes_sender() {
    let sim = running_sim();
    let llmq_type = test_params().llmq_type;
    let quorum = sim.node(3).ctx.registry().active_quorums(llmq_type)[0].clone();
    let bogus = RecoveredSig {
        llmq_type,
        quorum_hash: quorum.quorum_hash,
        id: sha256d(b"bogus-id"),
        msg_hash: sha256d(b"bogus"),
        sig: sim.masternodes.get(0).operator_key.sign(&sha256d(b"bogus")),
    };
    sim.node(3).ctx.signing().process_message(PeerId(77), bogus.clone());
    sim.settle();

    let reports = sim.hub.misbehavior();
    assert!(reports
        .iter()
        .any(|m| m.reporter == sim.node(3).peer && m.peer == PeerId(77)));
    assert_matches!(
        sim.node(3).ctx.signing().try_get_recovered(llmq_type, &bogus.id),
        RecoveredLookup::Missing
    );
}

#[test]
fn test_request_without_quorum_fails() {
    let sim = Simulation::builder(test_config())
        .masternodes(3)
        .build()
        .unwrap();
    sim.start().unwrap();
    sim.mine_until(5).unwrap();

    let err = sim
        .node(0)
        .ctx
        .signing()
        .request_signature(test_params().llmq_type, sha256d(b"id"), sha256d(b"msg"))
        .unwrap_err();
    assert_matches!(err, LlmqError::NoQuorum { .. });
}

#[test]
fn test_request_without_enough_shares_expires_as_no_quorum() {
    let sim = running_sim();
    let llmq_type = test_params().llmq_type;
    let id = sha256d(b"unanswered-id");
    let msg = sha256d(b"unanswered-message");
    sim.hub
        .set_drop_rule(|_, _, m| matches!(m, LlmqMessage::SigShare(_)));

    // Only one member contributes a share; the threshold is two.
    let signing = sim.node(0).ctx.signing();
    assert!(signing.request_signature(llmq_type, id, msg).unwrap());
    sim.settle();
    assert!(signing.is_outstanding(llmq_type, &id));
    assert_matches!(signing.try_get_recovered(llmq_type, &id), RecoveredLookup::Missing);

    sim.mine_until(SIGNING_HEIGHT + test_config().sig_share_expiry_blocks)
        .unwrap();

    assert!(!signing.is_outstanding(llmq_type, &id));
    let expired = assert_matches!(
        signing.try_get_recovered(llmq_type, &id),
        RecoveredLookup::Expired(request) => request
    );
    assert_eq!(expired.msg_hash, msg);
    assert_eq!(expired.requested_at, SIGNING_HEIGHT);
    assert_matches!(expired.to_error(), LlmqError::NoQuorum { .. });
    assert!(!signing.has_recovered(llmq_type, &id, &msg));
    for node in &sim.nodes()[1..] {
        assert_matches!(
            node.ctx.signing().try_get_recovered(llmq_type, &id),
            RecoveredLookup::Missing
        );
    }
}
