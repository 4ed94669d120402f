//! Quorum formation across whole nodes on a loopback network

use llmq::dkg::DkgPhase;
use llmq::ChainView;
use llmq_core::DkgErrorSimulation;
use llmq_testkit::{config_for, five_member_params, test_config, test_params, Simulation};

/// Height of the first DKG window; its commitment is mined one block after finalize
const BASE: u32 = 24;
const MINED: u32 = 35;

#[test]
fn test_honest_quorum_forms_on_every_node() {
    let sim = Simulation::builder(test_config())
        .masternodes(3)
        .observers(1)
        .build()
        .unwrap();
    sim.start().unwrap();
    sim.mine_until(MINED).unwrap();

    let llmq_type = test_params().llmq_type;
    let quorum_hash = sim.chain.block_hash(BASE).unwrap();
    for node in sim.nodes() {
        let quorum = node
            .ctx
            .registry()
            .lookup(llmq_type, &quorum_hash)
            .expect("quorum registered");
        assert_eq!(quorum.valid_members.count(), 3);
        assert_eq!(quorum.mined_height, MINED);
        assert_eq!(quorum.can_sign(), node.ctx.is_masternode());
    }

    let status = sim
        .node(0)
        .ctx
        .dkg()
        .diagnostics()
        .session(llmq_type, 0)
        .unwrap();
    assert_eq!(status.phase, DkgPhase::Finalized);
    assert!(status.failure.is_none());
    assert!(status.members.iter().all(|m| !m.bad));
    assert!(sim.hub.misbehavior().is_empty());
}

#[test]
fn test_unjustified_liar_is_excluded_from_quorum() {
    let params = five_member_params();
    let mut liar = config_for(params.clone());
    liar.dkg_error_simulation = DkgErrorSimulation {
        contribution_lie: 1.0,
        justify_omit: 1.0,
        ..Default::default()
    };
    let sim = Simulation::builder(config_for(params.clone()))
        .masternodes(5)
        .node_config(4, liar)
        .build()
        .unwrap();
    sim.start().unwrap();
    sim.mine_until(MINED).unwrap();

    let quorum_hash = sim.chain.block_hash(BASE).unwrap();
    let liar_pro_tx = sim.masternodes.get(4).entry.pro_tx_hash;
    let quorum = sim
        .node(0)
        .ctx
        .registry()
        .lookup(params.llmq_type, &quorum_hash)
        .expect("quorum registered");
    assert_eq!(quorum.valid_members.count(), 4);
    assert!(!quorum.is_valid_member(&liar_pro_tx));

    let liar_view = sim
        .node(4)
        .ctx
        .registry()
        .lookup(params.llmq_type, &quorum_hash)
        .expect("liar still learns the quorum");
    assert!(!liar_view.can_sign());
}

#[test]
fn test_three_omissions_fail_and_no_quorum_forms() {
    let params = five_member_params();
    let mut silent = config_for(params.clone());
    silent.dkg_error_simulation.contribution_omit = 1.0;
    let sim = Simulation::builder(config_for(params.clone()))
        .masternodes(5)
        .node_config(0, silent.clone())
        .node_config(1, silent.clone())
        .node_config(2, silent)
        .build()
        .unwrap();
    sim.start().unwrap();
    sim.mine_until(BASE + params.dkg_mining_window_end + 1).unwrap();

    let quorum_hash = sim.chain.block_hash(BASE).unwrap();
    for node in sim.nodes() {
        assert!(node
            .ctx
            .registry()
            .lookup(params.llmq_type, &quorum_hash)
            .is_none());
        assert!(node.ctx.registry().active_quorums(params.llmq_type).is_empty());
        assert!(node
            .ctx
            .ledger()
            .has_mined_commitment(params.llmq_type, &quorum_hash));
    }

    let status = sim
        .node(3)
        .ctx
        .dkg()
        .diagnostics()
        .session(params.llmq_type, 0)
        .unwrap();
    assert_eq!(status.phase, DkgPhase::Failed);
    assert!(status.failure.is_some());
}

#[test]
fn test_disconnecting_the_commitment_block_removes_the_quorum() {
    let sim = Simulation::builder(test_config())
        .masternodes(3)
        .build()
        .unwrap();
    sim.start().unwrap();
    sim.mine_until(MINED).unwrap();

    let llmq_type = test_params().llmq_type;
    let quorum_hash = sim.chain.block_hash(BASE).unwrap();
    assert!(sim.node(1).ctx.registry().lookup(llmq_type, &quorum_hash).is_some());

    let block = sim.disconnect_tip().unwrap();
    assert_eq!(block.height, MINED);
    for node in sim.nodes() {
        assert!(node.ctx.registry().lookup(llmq_type, &quorum_hash).is_none());
        assert!(!node.ctx.ledger().has_mined_commitment(llmq_type, &quorum_hash));
    }
}
