//! Request registration, recovered-signature store and listener dispatch

use super::{
    ExpiredRequest, RecoveredLookup, RecoveredSig, RecoveredSigListener, ShareSink, SigningRequest,
};
use crate::bls_worker::{BlsWorker, VerifyJob};
use crate::interfaces::{LocalMasternode, NetworkHandle, NetworkSlot};
use crate::messages::LlmqMessage;
use crate::quorums::QuorumRegistry;
use crate::worker::Worker;
use llmq_core::crypto::Signature;
use llmq_core::{
    build_sign_hash, BlockHeight, Hash32, LlmqConfig, LlmqError, LlmqType, PeerId, Result,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Misbehavior score for a recovered signature that does not verify
const INVALID_RECOVERED_SIG_SCORE: u32 = 100;

type RequestKey = (LlmqType, Hash32);

/// Input to the signing worker
#[derive(Debug)]
pub enum SigningEvent {
    /// A recovered signature, from a peer or from local share recovery
    Recovered {
        /// The signature
        sig: RecoveredSig,
        /// Sending peer; `None` when recovered locally
        from: Option<PeerId>,
    },
    /// A block was connected
    Tick(BlockHeight),
}

struct StoredSig {
    sig: RecoveredSig,
    height: BlockHeight,
}

struct Outstanding {
    msg_hash: Hash32,
    requested_at: BlockHeight,
}

#[derive(Default)]
struct SigningState {
    recovered: HashMap<RequestKey, StoredSig>,
    conflicts: HashMap<RequestKey, Vec<RecoveredSig>>,
    votes: HashMap<RequestKey, (Hash32, BlockHeight)>,
    outstanding: HashMap<RequestKey, Outstanding>,
    expired: HashMap<RequestKey, ExpiredRequest>,
    tip: BlockHeight,
}

enum Dispatch {
    Recovered(RecoveredSig),
    Conflict(RecoveredSig, RecoveredSig),
}

struct SigningShared {
    config: Arc<LlmqConfig>,
    registry: Arc<QuorumRegistry>,
    bls: Arc<BlsWorker>,
    local: Option<LocalMasternode>,
    state: Mutex<SigningState>,
    listeners: RwLock<HashMap<LlmqType, Vec<Arc<dyn RecoveredSigListener>>>>,
    share_sink: RwLock<Option<Arc<dyn ShareSink>>>,
    network: NetworkSlot,
}

/// Front door for threshold signing
pub struct SigningCoordinator {
    shared: Arc<SigningShared>,
    worker: Worker<SigningEvent>,
}

impl SigningCoordinator {
    /// Create the coordinator. The share sink is wired afterwards.
    pub fn new(
        config: Arc<LlmqConfig>,
        registry: Arc<QuorumRegistry>,
        bls: Arc<BlsWorker>,
        local: Option<LocalMasternode>,
    ) -> Self {
        let capacity = config.worker_queue_capacity;
        Self {
            shared: Arc::new(SigningShared {
                config,
                registry,
                bls,
                local,
                state: Mutex::new(SigningState::default()),
                listeners: RwLock::new(HashMap::new()),
                share_sink: RwLock::new(None),
                network: NetworkSlot::default(),
            }),
            worker: Worker::new("signing", capacity),
        }
    }

    /// Route local members' requests to share collection
    pub fn set_share_sink(&self, sink: Arc<dyn ShareSink>) {
        *self.shared.share_sink.write() = Some(sink);
    }

    /// Subscribe to recovered signatures of a type
    pub fn register_listener(&self, llmq_type: LlmqType, listener: Arc<dyn RecoveredSigListener>) {
        self.shared
            .listeners
            .write()
            .entry(llmq_type)
            .or_default()
            .push(listener);
    }

    /// Remove a subscription registered with `register_listener`
    pub fn unregister_listener(&self, llmq_type: LlmqType, listener: &Arc<dyn RecoveredSigListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        if let Some(list) = self.shared.listeners.write().get_mut(&llmq_type) {
            list.retain(|l| Arc::as_ptr(l) as *const () != target);
        }
    }

    /// Drop the share sink and every listener
    pub fn clear_wiring(&self) {
        self.shared.listeners.write().clear();
        *self.shared.share_sink.write() = None;
    }

    /// Start the worker
    pub fn start(&self, network: Arc<dyn NetworkHandle>) -> Result<()> {
        self.shared.network.set(network);
        let shared = Arc::clone(&self.shared);
        self.worker.start(move |batch| shared.handle_batch(batch))
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

    /// Whether the worker has nothing queued
    pub fn is_idle(&self) -> bool {
        self.worker.is_idle()
    }

    /// Whether the worker thread is running
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Queue a block tick for expiry and pruning
    pub fn tick(&self, height: BlockHeight) {
        if self.worker.is_running() {
            self.worker.submit_ordered(SigningEvent::Tick(height));
        }
    }

    /// Ask the responsible quorum to sign `msg_hash` under `id`.
    ///
    /// Returns `Ok(false)` when we already voted for a different message
    /// under the same id, and `NoQuorum` when no quorum is active.
    pub fn request_signature(&self, llmq_type: LlmqType, id: Hash32, msg_hash: Hash32) -> Result<bool> {
        self.shared.config.require_params(llmq_type)?;
        let sign_height = self.shared.registry.tip();
        let key = (llmq_type, id);
        {
            let mut state = self.shared.state.lock();
            match state.votes.get(&key) {
                Some((voted, _)) if *voted != msg_hash => {
                    warn!(
                        %llmq_type,
                        id = %id.short(),
                        voted = %voted.short(),
                        requested = %msg_hash.short(),
                        "refusing to sign a second message for the same id"
                    );
                    return Ok(false);
                }
                Some(_) => {}
                None => {
                    state.votes.insert(key, (msg_hash, sign_height));
                }
            }
            if state
                .recovered
                .get(&key)
                .is_some_and(|s| s.sig.msg_hash == msg_hash)
            {
                return Ok(true);
            }
        }

        let quorum = self
            .shared
            .registry
            .select_quorum_for_signing(llmq_type, &id, sign_height)
            .ok_or_else(|| {
                LlmqError::no_quorum(format!("no active {llmq_type} quorum at {sign_height}"))
            })?;

        let fresh = {
            let mut state = self.shared.state.lock();
            let fresh = !state.outstanding.contains_key(&key);
            if fresh {
                state.expired.remove(&key);
                state.outstanding.insert(
                    key,
                    Outstanding {
                        msg_hash,
                        requested_at: sign_height,
                    },
                );
            }
            fresh
        };

        let is_member = self
            .shared
            .local
            .as_ref()
            .is_some_and(|l| quorum.is_valid_member(&l.pro_tx_hash));
        if fresh && is_member && quorum.can_sign() {
            let sink = self.shared.share_sink.read().clone();
            if let Some(sink) = sink {
                debug!(
                    %llmq_type,
                    id = %id.short(),
                    quorum_hash = %quorum.quorum_hash.short(),
                    "signing request"
                );
                sink.start_request(SigningRequest {
                    id,
                    msg_hash,
                    quorum,
                    sign_height,
                });
            }
        }
        Ok(true)
    }

    /// Recovered signature state for a request id
    pub fn try_get_recovered(&self, llmq_type: LlmqType, id: &Hash32) -> RecoveredLookup {
        let state = self.shared.state.lock();
        let key = (llmq_type, *id);
        if let Some(candidates) = state.conflicts.get(&key) {
            return RecoveredLookup::Conflicting(candidates.clone());
        }
        if let Some(stored) = state.recovered.get(&key) {
            return RecoveredLookup::Recovered(stored.sig.clone());
        }
        match state.expired.get(&key) {
            Some(request) => RecoveredLookup::Expired(*request),
            None => RecoveredLookup::Missing,
        }
    }

    /// Whether a signature for `(id, msg_hash)` was recovered
    pub fn has_recovered(&self, llmq_type: LlmqType, id: &Hash32, msg_hash: &Hash32) -> bool {
        match self.try_get_recovered(llmq_type, id) {
            RecoveredLookup::Recovered(sig) => &sig.msg_hash == msg_hash,
            RecoveredLookup::Conflicting(sigs) => sigs.iter().any(|s| &s.msg_hash == msg_hash),
            RecoveredLookup::Missing | RecoveredLookup::Expired(_) => false,
        }
    }

    /// Whether a request for `id` is still waiting for recovery
    pub fn is_outstanding(&self, llmq_type: LlmqType, id: &Hash32) -> bool {
        self.shared
            .state
            .lock()
            .outstanding
            .contains_key(&(llmq_type, *id))
    }

    /// Hand a locally recovered signature to the worker
    pub fn post_recovered(&self, sig: RecoveredSig) {
        if self.worker.is_running() {
            self.worker.submit_ordered(SigningEvent::Recovered { sig, from: None });
        }
    }

    /// Queue a recovered signature gossiped by a peer
    pub fn process_message(&self, from: PeerId, sig: RecoveredSig) {
        if self.worker.is_running() {
            self.worker.submit(SigningEvent::Recovered {
                sig,
                from: Some(from),
            });
        }
    }

    /// Verify a signature made by the quorum responsible for `id` at `sign_height`
    pub fn verify_recovered_sig(
        &self,
        llmq_type: LlmqType,
        sign_height: BlockHeight,
        id: &Hash32,
        msg_hash: &Hash32,
        sig: &Signature,
    ) -> Result<bool> {
        let quorum = self
            .shared
            .registry
            .select_quorum_for_signing(llmq_type, id, sign_height)
            .ok_or_else(|| {
                LlmqError::no_quorum(format!("no active {llmq_type} quorum at {sign_height}"))
            })?;
        let sign_hash = build_sign_hash(llmq_type, &quorum.quorum_hash, id, msg_hash);
        Ok(self
            .shared
            .bls
            .verify(VerifyJob::new(quorum.public_key, sign_hash, *sig)))
    }

    /// Verify a signature claimed to come from a specific quorum
    pub fn verify_with_quorum(
        &self,
        llmq_type: LlmqType,
        quorum_hash: &Hash32,
        id: &Hash32,
        msg_hash: &Hash32,
        sig: &Signature,
    ) -> Result<bool> {
        let quorum = self.shared.registry.require_active(llmq_type, quorum_hash)?;
        let sign_hash = build_sign_hash(llmq_type, quorum_hash, id, msg_hash);
        Ok(self
            .shared
            .bls
            .verify(VerifyJob::new(quorum.public_key, sign_hash, *sig)))
    }
}

impl SigningShared {
    fn handle_batch(&self, batch: Vec<SigningEvent>) {
        let mut inbound = Vec::new();
        for event in batch {
            match event {
                SigningEvent::Tick(height) => {
                    self.verify_and_accept(std::mem::take(&mut inbound));
                    self.on_tick(height);
                }
                SigningEvent::Recovered { sig, from } => inbound.push((sig, from)),
            }
        }
        self.verify_and_accept(inbound);
    }

    /// Check peer signatures in one batch, then accept in arrival order
    fn verify_and_accept(&self, inbound: Vec<(RecoveredSig, Option<PeerId>)>) {
        if inbound.is_empty() {
            return;
        }
        let mut candidates = Vec::with_capacity(inbound.len());
        let mut jobs = Vec::new();
        for (sig, from) in inbound {
            if from.is_none() {
                candidates.push((sig, from, None));
                continue;
            }
            match self.registry.require_active(sig.llmq_type, &sig.quorum_hash) {
                Ok(quorum) => {
                    jobs.push(VerifyJob::new(quorum.public_key, sig.sign_hash(), sig.sig));
                    candidates.push((sig, from, Some(jobs.len() - 1)));
                }
                Err(e) => trace!(error = %e, "recovered signature for unusable quorum"),
            }
        }
        let results = self.bls.verify_batch(jobs);

        for (sig, from, job) in candidates {
            let valid = job.map_or(true, |i| results.get(i).copied().unwrap_or(false));
            if !valid {
                if let Some(peer) = from {
                    warn!(%peer, id = %sig.id.short(), "invalid recovered signature");
                    self.network.misbehaving(
                        peer,
                        INVALID_RECOVERED_SIG_SCORE,
                        "invalid recovered signature",
                    );
                }
                continue;
            }
            self.accept(sig);
        }
    }

    fn accept(&self, sig: RecoveredSig) {
        let key = (sig.llmq_type, sig.id);
        let dispatch = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let tip = state.tip;
            match state.recovered.get(&key) {
                Some(existing) if existing.sig.msg_hash == sig.msg_hash => None,
                Some(existing) => {
                    let existing = existing.sig.clone();
                    let candidates = state
                        .conflicts
                        .entry(key)
                        .or_insert_with(|| vec![existing.clone()]);
                    if candidates.iter().any(|c| c.msg_hash == sig.msg_hash) {
                        None
                    } else {
                        candidates.push(sig.clone());
                        Some(Dispatch::Conflict(existing, sig.clone()))
                    }
                }
                None => {
                    state.outstanding.remove(&key);
                    state.expired.remove(&key);
                    state.recovered.insert(
                        key,
                        StoredSig {
                            sig: sig.clone(),
                            height: tip,
                        },
                    );
                    Some(Dispatch::Recovered(sig.clone()))
                }
            }
        };
        let Some(dispatch) = dispatch else {
            trace!(id = %sig.id.short(), "duplicate recovered signature");
            return;
        };

        let listeners = self
            .listeners
            .read()
            .get(&sig.llmq_type)
            .cloned()
            .unwrap_or_default();
        match &dispatch {
            Dispatch::Recovered(s) => {
                info!(
                    llmq_type = %s.llmq_type,
                    id = %s.id.short(),
                    msg_hash = %s.msg_hash.short(),
                    quorum_hash = %s.quorum_hash.short(),
                    "signature recovered"
                );
                for l in &listeners {
                    l.on_recovered(s);
                }
            }
            Dispatch::Conflict(existing, new) => {
                warn!(
                    llmq_type = %new.llmq_type,
                    id = %new.id.short(),
                    existing = %existing.msg_hash.short(),
                    conflicting = %new.msg_hash.short(),
                    "conflicting recovered signatures"
                );
                for l in &listeners {
                    l.on_conflict(existing, new);
                }
            }
        }
        self.network.broadcast(LlmqMessage::RecoveredSig(sig));
    }

    fn on_tick(&self, height: BlockHeight) {
        let expiry = self.config.sig_share_expiry_blocks;
        let retention = self.config.recovered_sig_retention_blocks;
        let mut newly_expired = Vec::new();
        {
            let mut state = self.state.lock();
            state.tip = height;

            let keys: Vec<RequestKey> = state
                .outstanding
                .iter()
                .filter(|(_, o)| height.saturating_sub(o.requested_at) >= expiry)
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                if let Some(o) = state.outstanding.remove(&key) {
                    let request = ExpiredRequest {
                        llmq_type: key.0,
                        id: key.1,
                        msg_hash: o.msg_hash,
                        requested_at: o.requested_at,
                        expired_at: height,
                    };
                    state.expired.insert(key, request);
                    newly_expired.push(request);
                }
            }

            let cutoff = height.saturating_sub(retention);
            let before = state.recovered.len();
            state.recovered.retain(|_, s| s.height >= cutoff);
            let SigningState {
                recovered,
                conflicts,
                votes,
                expired,
                ..
            } = &mut *state;
            conflicts.retain(|k, _| recovered.contains_key(k));
            votes.retain(|_, (_, at)| *at >= cutoff);
            expired.retain(|_, r| r.expired_at >= cutoff);
            let pruned = before - recovered.len();
            if pruned > 0 {
                debug!(pruned, height, "pruned recovered signatures");
            }
        }

        for request in newly_expired {
            warn!(
                llmq_type = %request.llmq_type,
                error = %request.to_error(),
                "signing request expired"
            );
            let listeners = self
                .listeners
                .read()
                .get(&request.llmq_type)
                .cloned()
                .unwrap_or_default();
            for l in &listeners {
                l.on_expired(&request);
            }
        }
    }
}
