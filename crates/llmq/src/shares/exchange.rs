//! Share collection and recovery worker

use super::{RequestState, SigShare};
use crate::bls_worker::{BlsWorker, VerifyJob};
use crate::interfaces::{LocalMasternode, NetworkHandle, NetworkSlot};
use crate::messages::LlmqMessage;
use crate::quorums::{Quorum, QuorumRegistry};
use crate::signing::{
    RecoveredSig, RecoveredSigListener, ShareSink, SigningCoordinator, SigningRequest,
};
use crate::worker::Worker;
use llmq_core::crypto::{recover_signature, MemberId, Signature};
use llmq_core::{BlockHeight, Hash32, LlmqConfig, LlmqError, PeerId, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Score for a share that is malformed or does not verify
const BAD_SHARE_SCORE: u32 = 10;

/// Input to the share worker
#[derive(Debug)]
pub enum ShareEvent {
    /// Sign and collect for a local request
    Start(SigningRequest),
    /// A share from a peer
    Inbound {
        /// Sending peer
        from: PeerId,
        /// The share
        share: SigShare,
    },
    /// The signature for a sign hash was recovered and accepted
    RecoveredElsewhere(Hash32),
    /// A block was connected
    Tick(BlockHeight),
}

struct ShareSession {
    quorum: Arc<Quorum>,
    id: Hash32,
    msg_hash: Hash32,
    state: RequestState,
    shares: BTreeMap<u16, Signature>,
    created_at: BlockHeight,
    finished_at: Option<BlockHeight>,
}

impl ShareSession {
    fn new(quorum: Arc<Quorum>, id: Hash32, msg_hash: Hash32, now: BlockHeight) -> Self {
        Self {
            quorum,
            id,
            msg_hash,
            state: RequestState::Idle,
            shares: BTreeMap::new(),
            created_at: now,
            finished_at: None,
        }
    }

    fn finish(&mut self, state: RequestState, now: BlockHeight) {
        self.state = state;
        self.finished_at = Some(now);
    }
}

#[derive(Default)]
struct ExchangeState {
    sessions: HashMap<Hash32, ShareSession>,
    tip: BlockHeight,
}

struct ExchangeShared {
    config: Arc<LlmqConfig>,
    registry: Arc<QuorumRegistry>,
    signing: Arc<SigningCoordinator>,
    bls: Arc<BlsWorker>,
    local: Option<LocalMasternode>,
    state: Mutex<ExchangeState>,
    network: NetworkSlot,
}

/// Collects signature shares and recovers threshold signatures
pub struct ShareExchange {
    shared: Arc<ExchangeShared>,
    worker: Worker<ShareEvent>,
}

impl ShareExchange {
    /// Create the exchange
    pub fn new(
        config: Arc<LlmqConfig>,
        registry: Arc<QuorumRegistry>,
        signing: Arc<SigningCoordinator>,
        bls: Arc<BlsWorker>,
        local: Option<LocalMasternode>,
    ) -> Self {
        let capacity = config.worker_queue_capacity;
        Self {
            shared: Arc::new(ExchangeShared {
                config,
                registry,
                signing,
                bls,
                local,
                state: Mutex::new(ExchangeState::default()),
                network: NetworkSlot::default(),
            }),
            worker: Worker::new("sigshares", capacity),
        }
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

    /// Queue a block tick for expiry
    pub fn tick(&self, height: BlockHeight) {
        if self.worker.is_running() {
            self.worker.submit_ordered(ShareEvent::Tick(height));
        }
    }

    /// Queue a share gossiped by a peer
    pub fn process_message(&self, from: PeerId, share: SigShare) {
        if self.worker.is_running() {
            self.worker.submit(ShareEvent::Inbound { from, share });
        }
    }

    /// Collection state for a sign hash
    pub fn request_state(&self, sign_hash: &Hash32) -> RequestState {
        self.shared
            .state
            .lock()
            .sessions
            .get(sign_hash)
            .map_or(RequestState::Idle, |s| s.state)
    }

    /// Number of tracked requests
    pub fn session_count(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }
}

impl ShareSink for ShareExchange {
    fn start_request(&self, request: SigningRequest) {
        if self.worker.is_running() {
            self.worker.submit(ShareEvent::Start(request));
        }
    }
}

impl RecoveredSigListener for ShareExchange {
    fn on_recovered(&self, sig: &RecoveredSig) {
        if self.worker.is_running() {
            self.worker
                .submit(ShareEvent::RecoveredElsewhere(sig.sign_hash()));
        }
    }
}

impl ExchangeShared {
    fn handle_batch(&self, batch: Vec<ShareEvent>) {
        let mut inbound = Vec::new();
        for event in batch {
            match event {
                ShareEvent::Inbound { from, share } => inbound.push((from, share)),
                other => {
                    self.ingest(std::mem::take(&mut inbound));
                    match other {
                        ShareEvent::Start(request) => self.on_start(request),
                        ShareEvent::RecoveredElsewhere(sign_hash) => {
                            self.on_recovered_elsewhere(&sign_hash)
                        }
                        ShareEvent::Tick(height) => self.on_tick(height),
                        ShareEvent::Inbound { .. } => {}
                    }
                }
            }
        }
        self.ingest(inbound);
    }

    fn on_start(&self, request: SigningRequest) {
        let sign_hash = request.sign_hash();
        let quorum = Arc::clone(&request.quorum);
        let Some(local) = self.local.as_ref() else {
            return;
        };
        let (Some(index), Some(secret)) =
            (quorum.member_index(&local.pro_tx_hash), quorum.secret_share())
        else {
            debug!(quorum_hash = %quorum.quorum_hash.short(), "cannot sign, no key share");
            return;
        };
        let share = SigShare {
            llmq_type: quorum.llmq_type(),
            quorum_hash: quorum.quorum_hash,
            member_index: index as u16,
            id: request.id,
            msg_hash: request.msg_hash,
            sig: secret.sign(&sign_hash),
        };

        {
            let mut state = self.state.lock();
            let now = state.tip.max(request.sign_height);
            let session = state.sessions.entry(sign_hash).or_insert_with(|| {
                ShareSession::new(Arc::clone(&quorum), request.id, request.msg_hash, now)
            });
            if session.state != RequestState::Idle {
                return;
            }
            session.state = RequestState::AwaitingShares;
            session.shares.insert(share.member_index, share.sig);
        }
        debug!(
            id = %request.id.short(),
            sign_hash = %sign_hash.short(),
            member = index,
            "sending signature share"
        );
        if let Some(network) = self.network.get() {
            network.send_to_members(&quorum.members, LlmqMessage::SigShare(share));
        }
        self.try_recover(&sign_hash);
    }

    /// Check that a share names a valid member of a quorum we collect for.
    /// `Err(None)` means the share is not for us; `Err(Some(_))` is a peer fault.
    fn resolve(&self, share: &SigShare) -> std::result::Result<(Arc<Quorum>, VerifyJob), Option<LlmqError>> {
        let quorum = self
            .registry
            .require_active(share.llmq_type, &share.quorum_hash)
            .map_err(|e| {
                trace!(error = %e, "share for unusable quorum");
                None
            })?;
        if !quorum.can_sign() {
            return Err(None);
        }
        let index = share.member_index as usize;
        let Some(public_share) = quorum.public_share(index) else {
            return Err(Some(LlmqError::protocol(format!(
                "share from invalid member index {index}"
            ))));
        };
        let job = VerifyJob::new(public_share, share.sign_hash(), share.sig);
        Ok((quorum, job))
    }

    fn is_late_or_duplicate(&self, sign_hash: &Hash32, member_index: u16) -> bool {
        self.state
            .lock()
            .sessions
            .get(sign_hash)
            .is_some_and(|s| s.state.is_finished() || s.shares.contains_key(&member_index))
    }

    fn ingest(&self, inbound: Vec<(PeerId, SigShare)>) {
        if inbound.is_empty() {
            return;
        }
        let mut candidates = Vec::with_capacity(inbound.len());
        let mut jobs = Vec::with_capacity(inbound.len());
        for (from, share) in inbound {
            let sign_hash = share.sign_hash();
            if self.is_late_or_duplicate(&sign_hash, share.member_index) {
                trace!(%from, member = share.member_index, "late or duplicate share");
                continue;
            }
            match self.resolve(&share) {
                Ok((quorum, job)) => {
                    jobs.push(job);
                    candidates.push((from, share, sign_hash, quorum));
                }
                Err(Some(e)) => {
                    warn!(%from, error = %e, "malformed signature share");
                    self.network.misbehaving(from, BAD_SHARE_SCORE, &e.to_string());
                }
                Err(None) => {}
            }
        }

        let results = self.bls.verify_batch(jobs);
        let mut touched = Vec::new();
        let mut invalid = Vec::new();
        {
            let mut state = self.state.lock();
            let now = state.tip;
            for ((from, share, sign_hash, quorum), ok) in candidates.into_iter().zip(results) {
                if !ok {
                    invalid.push((from, share.member_index));
                    continue;
                }
                let session = state
                    .sessions
                    .entry(sign_hash)
                    .or_insert_with(|| ShareSession::new(quorum, share.id, share.msg_hash, now));
                if session.state.is_finished() {
                    continue;
                }
                if session.shares.insert(share.member_index, share.sig).is_none()
                    && !touched.contains(&sign_hash)
                {
                    touched.push(sign_hash);
                }
            }
        }
        for (from, member) in invalid {
            warn!(%from, member, "invalid signature share");
            self.network
                .misbehaving(from, BAD_SHARE_SCORE, "invalid signature share");
        }
        for sign_hash in touched {
            self.try_recover(&sign_hash);
        }
    }

    fn try_recover(&self, sign_hash: &Hash32) {
        let (quorum, id, msg_hash, shares) = {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.get_mut(sign_hash) else {
                return;
            };
            if session.state != RequestState::AwaitingShares
                || session.shares.len() < session.quorum.threshold()
            {
                return;
            }
            session.state = RequestState::Recovering;
            let shares: Vec<(MemberId, Signature)> = session
                .shares
                .iter()
                .filter_map(|(i, sig)| Some((session.quorum.member_id(*i as usize)?, *sig)))
                .collect();
            (Arc::clone(&session.quorum), session.id, session.msg_hash, shares)
        };

        let recovered = recover_signature(&shares, quorum.threshold()).and_then(|sig| {
            if sig.verify(&quorum.public_key, sign_hash) {
                Ok(sig)
            } else {
                Err(LlmqError::crypto("recovered signature does not verify"))
            }
        });

        let mut state = self.state.lock();
        let now = state.tip;
        let Some(session) = state.sessions.get_mut(sign_hash) else {
            return;
        };
        match recovered {
            Ok(sig) => {
                session.finish(RequestState::Recovered, now);
                drop(state);
                debug!(id = %id.short(), shares = shares.len(), "recovered signature");
                self.signing.post_recovered(RecoveredSig {
                    llmq_type: quorum.llmq_type(),
                    quorum_hash: quorum.quorum_hash,
                    id,
                    msg_hash,
                    sig,
                });
            }
            Err(e) => {
                error!(id = %id.short(), error = %e, "signature recovery failed");
                session.state = RequestState::AwaitingShares;
            }
        }
    }

    fn on_recovered_elsewhere(&self, sign_hash: &Hash32) {
        let mut state = self.state.lock();
        let now = state.tip;
        if let Some(session) = state.sessions.get_mut(sign_hash) {
            if !session.state.is_finished() {
                session.finish(RequestState::Recovered, now);
            }
        }
    }

    fn on_tick(&self, height: BlockHeight) {
        let expiry = self.config.sig_share_expiry_blocks;
        let mut state = self.state.lock();
        state.tip = height;
        for (sign_hash, session) in state.sessions.iter_mut() {
            if !session.state.is_finished() && height.saturating_sub(session.created_at) >= expiry {
                debug!(
                    sign_hash = %sign_hash.short(),
                    shares = session.shares.len(),
                    "signing request expired"
                );
                session.finish(RequestState::Expired, height);
            }
        }
        state.sessions.retain(|_, s| {
            s.finished_at
                .map_or(true, |at| height.saturating_sub(at) < expiry)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::{FinalCommitment, MinedCommitment};
    use crate::dkg::KeyShareStore;
    use crate::interfaces::{MasternodeEntry, MasternodeList};
    use llmq_core::crypto::SecretKey;
    use llmq_core::{sha256d, LlmqParams, LlmqType, MemberSet};

    struct NoMembers;

    impl MasternodeList for NoMembers {
        fn quorum_members(&self, _: &LlmqParams, _: &Hash32) -> Vec<MasternodeEntry> {
            Vec::new()
        }
    }

    fn exchange() -> ShareExchange {
        let config = Arc::new(LlmqConfig::single_type(LlmqParams::preset(LlmqType::LlmqTest)));
        let registry = Arc::new(QuorumRegistry::new(
            Arc::clone(&config),
            Arc::new(NoMembers),
            Arc::new(KeyShareStore::new()),
        ));
        let bls = Arc::new(BlsWorker::new(1));
        let signing = Arc::new(SigningCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&bls),
            None,
        ));
        ShareExchange::new(config, registry, signing, bls, None)
    }

    fn quorum() -> Arc<Quorum> {
        let members: Vec<MasternodeEntry> = (0..3u8)
            .map(|i| MasternodeEntry {
                pro_tx_hash: sha256d(&[i]),
                operator_public_key: SecretKey::from_seed(&[i]).unwrap().public_key(),
                peer: PeerId(u64::from(i)),
            })
            .collect();
        let mut commitment = FinalCommitment::null(LlmqType::LlmqTest, sha256d(b"q"), 0, 3);
        commitment.valid_members = MemberSet::full(3);
        commitment.quorum_public_key = Some(SecretKey::from_seed(b"q").unwrap().public_key());
        let mined = MinedCommitment {
            commitment,
            base_height: 24,
            mined_height: 35,
        };
        Arc::new(
            Quorum::from_commitment(LlmqParams::preset(LlmqType::LlmqTest), &mined, members, None)
                .unwrap(),
        )
    }

    #[test]
    fn test_unrecovered_request_expires_then_is_dropped() {
        let exchange = exchange();
        let shared = &exchange.shared;
        let expiry = shared.config.sig_share_expiry_blocks;
        let sign_hash = sha256d(b"sign-hash");
        {
            let mut session = ShareSession::new(quorum(), sha256d(b"id"), sha256d(b"msg"), 20);
            session.state = RequestState::AwaitingShares;
            session.shares.insert(0, SecretKey::from_seed(b"m0").unwrap().sign(&sign_hash));
            shared.state.lock().sessions.insert(sign_hash, session);
        }

        shared.on_tick(19 + expiry);
        assert_eq!(exchange.request_state(&sign_hash), RequestState::AwaitingShares);

        shared.on_tick(20 + expiry);
        assert_eq!(exchange.request_state(&sign_hash), RequestState::Expired);
        assert_eq!(exchange.session_count(), 1);
        // Late shares for a finished request are ignored.
        assert!(shared.is_late_or_duplicate(&sign_hash, 1));

        shared.on_tick(19 + 2 * expiry);
        assert_eq!(exchange.session_count(), 1);
        shared.on_tick(20 + 2 * expiry);
        assert_eq!(exchange.session_count(), 0);
        assert_eq!(exchange.request_state(&sign_hash), RequestState::Idle);
    }

    #[test]
    fn test_recovered_elsewhere_finishes_collection() {
        let exchange = exchange();
        let shared = &exchange.shared;
        let expiry = shared.config.sig_share_expiry_blocks;
        let sign_hash = sha256d(b"sign-hash");
        let mut session = ShareSession::new(quorum(), sha256d(b"id"), sha256d(b"msg"), 20);
        session.state = RequestState::AwaitingShares;
        shared.state.lock().sessions.insert(sign_hash, session);
        shared.on_tick(20);

        shared.on_recovered_elsewhere(&sign_hash);
        assert_eq!(exchange.request_state(&sign_hash), RequestState::Recovered);
        shared.on_tick(19 + expiry);
        assert_eq!(exchange.request_state(&sign_hash), RequestState::Recovered);
        shared.on_tick(20 + expiry);
        assert_eq!(exchange.session_count(), 0);
    }
}
