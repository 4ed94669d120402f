//! Drives the local DKG sessions from block ticks and peer messages

use super::diagnostics::DkgDiagnostics;
use super::phase::DkgPhase;
use super::session::{DkgOutcome, DkgSession, SessionStep};
use super::share_store::KeyShareStore;
use super::types::DkgMessage;
use crate::commitment::{CommitmentLedger, FinalCommitment};
use crate::interfaces::{
    LocalMasternode, MasternodeEntry, MasternodeList, NetworkHandle, NetworkSlot,
};
use crate::messages::LlmqMessage;
use crate::quorums::QuorumRegistry;
use crate::worker::Worker;
use llmq_core::{
    BlockHeight, Hash32, LlmqConfig, LlmqError, LlmqParams, LlmqType, PeerId, Result,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Misbehavior score for an invalid DKG message
const DKG_MISBEHAVIOR_SCORE: u32 = 10;

/// Input to the DKG worker
#[derive(Debug)]
pub enum DkgEvent {
    /// A block was connected
    Tick {
        /// New tip height
        height: BlockHeight,
        /// New tip hash
        hash: Hash32,
    },
    /// A DKG message arrived from a peer
    Message {
        /// Sending peer
        from: PeerId,
        /// The message
        msg: DkgMessage,
    },
}

struct DkgShared {
    config: Arc<LlmqConfig>,
    masternodes: Arc<dyn MasternodeList>,
    local: Option<LocalMasternode>,
    ledger: Arc<CommitmentLedger>,
    registry: Arc<QuorumRegistry>,
    key_shares: Arc<KeyShareStore>,
    diagnostics: Arc<DkgDiagnostics>,
    network: NetworkSlot,
    sessions: Mutex<HashMap<(LlmqType, u32), DkgSession>>,
}

/// Owner of the local DKG sessions, one per (type, quorum index)
pub struct DkgCoordinator {
    shared: Arc<DkgShared>,
    worker: Worker<DkgEvent>,
}

impl DkgCoordinator {
    /// Create the coordinator; sessions only start on masternodes
    pub fn new(
        config: Arc<LlmqConfig>,
        masternodes: Arc<dyn MasternodeList>,
        local: Option<LocalMasternode>,
        ledger: Arc<CommitmentLedger>,
        registry: Arc<QuorumRegistry>,
        key_shares: Arc<KeyShareStore>,
    ) -> Self {
        let capacity = config.worker_queue_capacity;
        Self {
            shared: Arc::new(DkgShared {
                config,
                masternodes,
                local,
                ledger,
                registry,
                key_shares,
                diagnostics: Arc::new(DkgDiagnostics::new()),
                network: NetworkSlot::default(),
                sessions: Mutex::new(HashMap::new()),
            }),
            worker: Worker::new("dkg", capacity),
        }
    }

    /// Start the protocol pump
    pub fn start(&self, network: Arc<dyn NetworkHandle>) -> Result<()> {
        if self.shared.local.is_none() {
            return Err(LlmqError::invariant("dkg started on a non-masternode"));
        }
        self.shared.network.set(network);
        let shared = Arc::clone(&self.shared);
        self.worker.start(move |batch| {
            for event in batch {
                shared.handle(event);
            }
        })
    }

    /// Make the worker exit
    pub fn interrupt(&self) {
        self.worker.interrupt();
    }

    /// Join the worker and detach from the network
    pub fn stop(&self) {
        self.worker.stop();
        self.shared.network.clear();
    }

    /// Queue a block tick. Ticks are never dropped.
    pub fn tick(&self, height: BlockHeight, hash: Hash32) {
        if self.worker.is_running() {
            self.worker.submit_ordered(DkgEvent::Tick { height, hash });
        }
    }

    /// Queue a DKG message from a peer
    pub fn process_message(&self, from: PeerId, msg: DkgMessage) {
        if self.worker.is_running() {
            self.worker.submit(DkgEvent::Message { from, msg });
        }
    }

    /// Offer a gossiped final commitment to the pending pool
    pub fn process_final_commitment(&self, from: PeerId, commitment: FinalCommitment) {
        match self.shared.ledger.add_pending(commitment) {
            Ok(_) => {}
            Err(e) if e.is_peer_fault() => {
                self.shared
                    .network
                    .misbehaving(from, DKG_MISBEHAVIOR_SCORE, &e.to_string());
            }
            Err(e) => debug!(%from, error = %e, "final commitment ignored"),
        }
    }

    /// Begin a session for a window opening at `base_height`.
    ///
    /// Returns `Ok(true)` when a session was started, `Ok(false)` when the
    /// local node is not in the committee.
    pub fn start_window(
        &self,
        llmq_type: LlmqType,
        quorum_index: u32,
        base_height: BlockHeight,
        base_hash: Hash32,
    ) -> Result<bool> {
        let params = self.shared.config.require_params(llmq_type)?.clone();
        self.shared
            .start_window(&params, quorum_index, base_height, base_hash)
    }

    /// Phase of the current session for a quorum slot
    pub fn session_phase(&self, llmq_type: LlmqType, quorum_index: u32) -> Option<DkgPhase> {
        self.shared
            .sessions
            .lock()
            .get(&(llmq_type, quorum_index))
            .map(DkgSession::phase)
    }

    /// Session diagnostics
    pub fn diagnostics(&self) -> &Arc<DkgDiagnostics> {
        &self.shared.diagnostics
    }

    /// Whether the worker has nothing queued
    pub fn is_idle(&self) -> bool {
        self.worker.is_idle()
    }
}

impl DkgShared {
    fn handle(&self, event: DkgEvent) {
        match event {
            DkgEvent::Tick { height, hash } => self.on_tick(height, hash),
            DkgEvent::Message { from, msg } => self.on_message(from, msg),
        }
    }

    fn start_window(
        &self,
        params: &LlmqParams,
        quorum_index: u32,
        base_height: BlockHeight,
        base_hash: Hash32,
    ) -> Result<bool> {
        let Some(local) = self.local.as_ref() else {
            return Ok(false);
        };
        let key = (params.llmq_type, quorum_index);
        let members = self.masternodes.quorum_members(params, &base_hash);
        if !members.iter().any(|m| m.pro_tx_hash == local.pro_tx_hash) {
            debug!(
                llmq_type = %params.llmq_type,
                base_height,
                "not a committee member"
            );
            self.sessions.lock().remove(&key);
            return Ok(false);
        }
        if members.len() < params.min_size {
            debug!(
                llmq_type = %params.llmq_type,
                committee = members.len(),
                min_size = params.min_size,
                "committee too small"
            );
            self.sessions.lock().remove(&key);
            return Ok(false);
        }

        let session = DkgSession::new(
            params.clone(),
            quorum_index,
            base_hash,
            base_height,
            members,
            local,
            self.config.dkg_error_simulation.clone(),
            Arc::clone(&self.diagnostics),
        )?;
        info!(
            llmq_type = %params.llmq_type,
            quorum_index,
            base_height,
            member = session.my_index(),
            "dkg session started"
        );
        if let Some(old) = self.sessions.lock().insert(key, session) {
            if !old.phase().is_terminal() {
                warn!(
                    quorum_hash = %old.quorum_hash().short(),
                    phase = ?old.phase(),
                    "abandoning unfinished dkg session"
                );
            }
        }
        Ok(true)
    }

    fn on_tick(&self, height: BlockHeight, hash: Hash32) {
        for params in &self.config.params {
            let index = height % params.dkg_interval;
            if index < params.quorums_per_window {
                if let Err(e) = self.start_window(params, index, height, hash) {
                    warn!(llmq_type = %params.llmq_type, error = %e, "cannot start dkg session");
                }
            }
        }

        let mut rng = rand::thread_rng();
        let mut results: Vec<(Vec<MasternodeEntry>, SessionStep)> = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            for session in sessions.values_mut() {
                let step = session.advance(height, &mut rng);
                if !step.messages.is_empty() || step.outcome.is_some() {
                    results.push((session.members().to_vec(), step));
                }
            }
        }

        for (members, step) in results {
            self.send(&members, step.messages);
            match step.outcome {
                Some(DkgOutcome::Finalized {
                    commitment,
                    key_share,
                }) => self.on_finalized(commitment, key_share),
                Some(DkgOutcome::Failed(_)) | None => {}
            }
        }
    }

    fn send(&self, members: &[MasternodeEntry], messages: Vec<DkgMessage>) {
        if messages.is_empty() {
            return;
        }
        let Some(network) = self.network.get() else {
            return;
        };
        for msg in messages {
            network.send_to_members(members, LlmqMessage::Dkg(msg));
        }
    }

    fn on_finalized(&self, commitment: FinalCommitment, key_share: Option<super::LocalKeyShare>) {
        let llmq_type = commitment.llmq_type;
        let quorum_hash = commitment.quorum_hash;
        if let Some(share) = key_share {
            self.key_shares.insert(llmq_type, quorum_hash, share);
            self.registry.on_local_share(llmq_type, &quorum_hash);
        }
        if let Err(e) = self.ledger.add_pending(commitment.clone()) {
            warn!(error = %e, "own final commitment rejected");
            return;
        }
        self.network.broadcast(LlmqMessage::FinalCommitment(commitment));
    }

    fn on_message(&self, from: PeerId, msg: DkgMessage) {
        let header = *msg.header();
        let kind = msg.kind();
        let result = {
            let mut sessions = self.sessions.lock();
            let session = sessions.values_mut().find(|s| {
                s.llmq_type() == header.llmq_type && s.quorum_hash() == &header.quorum_hash
            });
            match session {
                Some(session) => session.receive(msg),
                None => {
                    trace!(%from, kind, "no session for dkg message");
                    return;
                }
            }
        };
        match result {
            Ok(true) => trace!(%from, kind, member = header.member_index, "dkg message accepted"),
            Ok(false) => {}
            Err(e) if e.is_peer_fault() => {
                warn!(%from, kind, error = %e, "invalid dkg message");
                self.network
                    .misbehaving(from, DKG_MISBEHAVIOR_SCORE, &e.to_string());
            }
            Err(e) => debug!(%from, kind, error = %e, "dkg message ignored"),
        }
    }
}

