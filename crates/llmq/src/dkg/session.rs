//! One member's run of the DKG protocol for one quorum
//!
//! The session is a pure state machine: the coordinator feeds it block
//! heights and verified messages, and sends whatever it returns to the other
//! committee members. Each phase's action runs once, when the block clock
//! enters it. Messages for a phase are accepted until the receiver has moved
//! past that phase, so members a block behind each other still agree.
//!
//! Phase actions:
//!
//! - Contribute: deal a random polynomial, encrypt one evaluation per member
//! - Complain: decrypt and check our evaluations, complain about bad dealers
//! - Justify: reveal evaluations that were complained about
//! - Commit: fix the valid set, derive the quorum key and our key share,
//!   send a premature commitment
//! - Finalize: aggregate matching premature commitments into the final
//!   commitment

use super::diagnostics::DkgDiagnostics;
use super::phase::DkgPhase;
use super::share_store::LocalKeyShare;
use super::types::{
    Complaint, Contribution, DkgHeader, DkgMessage, Justification, PrematureCommitment, Signed,
};
use crate::commitment::{commitment_hash, FinalCommitment};
use crate::interfaces::{LocalMasternode, MasternodeEntry};
use llmq_core::crypto::{
    aggregate_secret_shares, ies, member_scalar, recover_signature, verify_secret_share, MemberId,
    Polynomial, SecretKey, Signature, VerificationVector,
};
use llmq_core::{
    BlockHeight, DkgErrorSimulation, Hash32, LlmqError, LlmqParams, LlmqType, MemberSet, Result,
};
use rand::{CryptoRng, RngCore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a session ended
#[derive(Debug)]
pub enum DkgOutcome {
    /// A final commitment was built; the key share is present when we are a valid member
    Finalized {
        /// Commitment for block inclusion
        commitment: FinalCommitment,
        /// Our share of the quorum key
        key_share: Option<LocalKeyShare>,
    },
    /// No quorum formed
    Failed(String),
}

/// Output of advancing a session
#[derive(Debug, Default)]
pub struct SessionStep {
    /// Messages for the other committee members
    pub messages: Vec<DkgMessage>,
    /// Set once, when the session reaches a terminal phase
    pub outcome: Option<DkgOutcome>,
}

/// Associated data binding a contribution ciphertext to its session and slot
fn contribution_aad(header: &DkgHeader, recipient: usize) -> Vec<u8> {
    let mut aad = Vec::with_capacity(37);
    aad.push(header.llmq_type.as_u8());
    aad.extend_from_slice(header.quorum_hash.as_bytes());
    aad.extend_from_slice(&header.member_index.to_le_bytes());
    aad.extend_from_slice(&(recipient as u16).to_le_bytes());
    aad
}

/// Local DKG session state
pub struct DkgSession {
    params: LlmqParams,
    quorum_index: u32,
    quorum_hash: Hash32,
    base_height: BlockHeight,
    members: Vec<MasternodeEntry>,
    member_ids: Vec<MemberId>,
    my_index: usize,
    operator_key: SecretKey,
    faults: DkgErrorSimulation,
    diagnostics: Arc<DkgDiagnostics>,
    phase: DkgPhase,

    polynomial: Option<Polynomial>,
    contributions: Vec<Option<Contribution>>,
    complaints: Vec<Option<Complaint>>,
    justifications: Vec<Option<Justification>>,
    prematures: Vec<Option<PrematureCommitment>>,

    /// Evaluations dealt to us, by dealer
    received_shares: Vec<Option<SecretKey>>,
    /// Dealers we consider bad
    bad: MemberSet,
    /// Complainers per dealer
    complaints_against: Vec<MemberSet>,
}

impl DkgSession {
    /// Create the session for the local member of `members`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: LlmqParams,
        quorum_index: u32,
        quorum_hash: Hash32,
        base_height: BlockHeight,
        members: Vec<MasternodeEntry>,
        local: &LocalMasternode,
        faults: DkgErrorSimulation,
        diagnostics: Arc<DkgDiagnostics>,
    ) -> Result<Self> {
        let my_index = members
            .iter()
            .position(|m| m.pro_tx_hash == local.pro_tx_hash)
            .ok_or_else(|| LlmqError::invalid("local masternode is not a committee member"))?;
        if members[my_index].operator_public_key != local.operator_key.public_key() {
            return Err(LlmqError::invalid(
                "operator key does not match the masternode list",
            ));
        }
        let member_ids = members
            .iter()
            .map(|m| member_scalar(&m.pro_tx_hash))
            .collect::<Result<Vec<_>>>()?;
        let n = members.len();

        diagnostics.init_local_session_status(
            params.llmq_type,
            quorum_index,
            quorum_hash,
            base_height,
            n,
            my_index,
        );

        Ok(Self {
            params,
            quorum_index,
            quorum_hash,
            base_height,
            members,
            member_ids,
            my_index,
            operator_key: local.operator_key.clone(),
            faults,
            diagnostics,
            phase: DkgPhase::Initialized,
            polynomial: None,
            contributions: vec![None; n],
            complaints: vec![None; n],
            justifications: vec![None; n],
            prematures: vec![None; n],
            received_shares: vec![None; n],
            bad: MemberSet::new(n),
            complaints_against: vec![MemberSet::new(n); n],
        })
    }

    /// Current phase
    pub fn phase(&self) -> DkgPhase {
        self.phase
    }

    /// Quorum type
    pub fn llmq_type(&self) -> LlmqType {
        self.params.llmq_type
    }

    /// Committee of this session
    pub fn members(&self) -> &[MasternodeEntry] {
        &self.members
    }

    /// Base block hash
    pub fn quorum_hash(&self) -> &Hash32 {
        &self.quorum_hash
    }

    /// Our position in the committee
    pub fn my_index(&self) -> usize {
        self.my_index
    }

    fn header(&self) -> DkgHeader {
        DkgHeader {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum_hash,
            member_index: self.my_index as u16,
        }
    }

    fn n(&self) -> usize {
        self.members.len()
    }

    fn note_session(&self, update: impl FnOnce(&mut super::diagnostics::SessionStatus)) {
        self.diagnostics
            .update_local_session_status(self.params.llmq_type, self.quorum_index, update);
    }

    fn note_member(&self, index: usize, update: impl FnOnce(&mut super::diagnostics::MemberStatus)) {
        self.diagnostics.update_local_member_status(
            self.params.llmq_type,
            self.quorum_index,
            index,
            update,
        );
    }

    /// Move the session to the phase scheduled at `height`, running each
    /// entered phase's action in order.
    pub fn advance<R>(&mut self, height: BlockHeight, rng: &mut R) -> SessionStep
    where
        R: RngCore + CryptoRng,
    {
        let mut step = SessionStep::default();
        if self.phase.is_terminal() {
            return step;
        }
        let target = DkgPhase::at_height(&self.params, self.base_height, height);

        while let Some(next) = self.phase.next() {
            if target.is_some_and(|t| next > t) {
                break;
            }
            self.phase = next;
            self.note_session(|s| s.phase = next);
            if let Err(e) = self.enter(next, rng, &mut step) {
                self.fail(format!("{next:?}: {e}"), &mut step);
            }
            if self.phase.is_terminal() {
                break;
            }
        }

        if target.is_none() && !self.phase.is_terminal() {
            self.fail("schedule ran out".to_string(), &mut step);
        }
        step
    }

    fn fail(&mut self, reason: String, step: &mut SessionStep) {
        warn!(
            llmq_type = %self.params.llmq_type,
            quorum_hash = %self.quorum_hash.short(),
            %reason,
            "dkg session failed"
        );
        self.phase = DkgPhase::Failed;
        self.polynomial = None;
        let recorded = reason.clone();
        self.note_session(|s| {
            s.phase = DkgPhase::Failed;
            s.failure = Some(recorded);
        });
        step.outcome = Some(DkgOutcome::Failed(reason));
    }

    fn enter<R>(&mut self, phase: DkgPhase, rng: &mut R, step: &mut SessionStep) -> Result<()>
    where
        R: RngCore + CryptoRng,
    {
        match phase {
            DkgPhase::Contribute => self.contribute(rng, step),
            DkgPhase::Complain => self.verify_and_complain(rng, step),
            DkgPhase::Justify => self.verify_and_justify(rng, step),
            DkgPhase::Commit => self.verify_and_commit(rng, step),
            DkgPhase::Finalize => self.finalize(step),
            DkgPhase::Initialized | DkgPhase::Finalized | DkgPhase::Failed => Ok(()),
        }
    }

    fn contribute<R: RngCore + CryptoRng>(&mut self, rng: &mut R, step: &mut SessionStep) -> Result<()> {
        if DkgErrorSimulation::should_fault(self.faults.contribution_omit, rng) {
            info!(quorum_hash = %self.quorum_hash.short(), "simulating omitted contribution");
            return Ok(());
        }

        let poly = Polynomial::random(self.params.threshold, rng);
        let vvec = poly.verification_vector();
        let header = self.header();
        let n = self.n();
        let mut blobs = Vec::with_capacity(n);
        for (j, member) in self.members.iter().enumerate() {
            let mut point = j;
            if j != self.my_index
                && DkgErrorSimulation::should_fault(self.faults.contribution_lie, rng)
            {
                point = (j + 1) % n;
                info!(recipient = j, "simulating corrupted contribution");
            }
            let share = poly.evaluate(&self.member_ids[point]);
            let aad = contribution_aad(&header, j);
            blobs.push(ies::encrypt(
                &member.operator_public_key,
                &share.to_bytes(),
                &aad,
                rng,
            )?);
        }

        let body = Contribution {
            header,
            vvec,
            contributions: blobs,
        };
        self.received_shares[self.my_index] = Some(poly.evaluate(&self.member_ids[self.my_index]));
        self.contributions[self.my_index] = Some(body.clone());
        self.polynomial = Some(poly);
        step.messages
            .push(DkgMessage::Contribution(Signed::sign(body, &self.operator_key)?));
        self.note_session(|s| s.sent_contributions = true);
        debug!(quorum_hash = %self.quorum_hash.short(), "sent contributions");
        Ok(())
    }

    /// Decrypt and check the evaluation `dealer` sent us
    fn check_contribution(&self, dealer: usize, c: &Contribution) -> Option<SecretKey> {
        let blob = c.contributions.get(self.my_index)?;
        let aad = contribution_aad(&c.header, self.my_index);
        let plain = ies::decrypt(&self.operator_key, blob, &aad).ok()?;
        let bytes: [u8; 32] = plain.as_slice().try_into().ok()?;
        let share = SecretKey::from_bytes(&bytes).ok()?;
        verify_secret_share(&c.vvec, &self.member_ids[self.my_index], &share).then(|| {
            debug!(dealer, "contribution verified");
            share
        })
    }

    fn well_formed(&self, c: &Contribution) -> bool {
        c.vvec.len() == self.params.threshold && c.contributions.len() == self.n()
    }

    fn verify_and_complain<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        step: &mut SessionStep,
    ) -> Result<()> {
        let n = self.n();
        let mut bad_members = MemberSet::new(n);
        let mut complaints = MemberSet::new(n);

        for dealer in 0..n {
            let Some(c) = self.contributions[dealer].as_ref() else {
                debug!(dealer, "no contribution");
                bad_members.set(dealer, true);
                continue;
            };
            if !self.well_formed(c) {
                bad_members.set(dealer, true);
                continue;
            }
            if dealer == self.my_index {
                continue;
            }
            match self.check_contribution(dealer, c) {
                Some(share) => {
                    if DkgErrorSimulation::should_fault(self.faults.complain_lie, rng) {
                        info!(dealer, "simulating false complaint");
                        complaints.set(dealer, true);
                    }
                    self.received_shares[dealer] = Some(share);
                }
                None => {
                    warn!(dealer, "invalid secret contribution");
                    complaints.set(dealer, true);
                }
            }
        }

        for dealer in bad_members.iter_set() {
            self.bad.set(dealer, true);
            self.note_member(dealer, |m| m.bad = true);
        }
        for dealer in complaints.iter_set() {
            self.note_member(dealer, |m| m.we_complained = true);
        }

        let body = Complaint {
            header: self.header(),
            bad_members,
            complaints,
        };
        let send = body.bad_members.count() > 0 || body.complaints.count() > 0;
        self.complaints[self.my_index] = Some(body.clone());
        if send {
            step.messages
                .push(DkgMessage::Complaint(Signed::sign(body, &self.operator_key)?));
            self.note_session(|s| s.sent_complaint = true);
        }
        Ok(())
    }

    fn verify_and_justify<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        step: &mut SessionStep,
    ) -> Result<()> {
        let n = self.n();
        let mut bad_votes = vec![0usize; n];
        for (from, complaint) in self.complaints.iter().enumerate() {
            let Some(c) = complaint else { continue };
            if c.bad_members.len() != n || c.complaints.len() != n {
                continue;
            }
            for dealer in c.bad_members.iter_set() {
                bad_votes[dealer] += 1;
            }
            for dealer in c.complaints.iter_set() {
                self.complaints_against[dealer].set(from, true);
            }
        }
        for (dealer, votes) in bad_votes.iter().enumerate() {
            if *votes >= self.params.dkg_bad_votes_threshold && !self.bad.get(dealer) {
                debug!(dealer, votes, "member voted bad");
                self.bad.set(dealer, true);
                self.note_member(dealer, |m| m.bad = true);
            }
            let against = self.complaints_against[dealer].count();
            self.note_member(dealer, |m| m.complaints_against = against);
        }

        let complainers = self.complaints_against[self.my_index].clone();
        if complainers.count() == 0 || self.bad.get(self.my_index) {
            return Ok(());
        }
        let Some(poly) = self.polynomial.as_ref() else {
            return Ok(());
        };
        if DkgErrorSimulation::should_fault(self.faults.justify_omit, rng) {
            info!(quorum_hash = %self.quorum_hash.short(), "simulating omitted justification");
            return Ok(());
        }

        let mut revealed = Vec::with_capacity(complainers.count());
        for recipient in complainers.iter_set() {
            let mut point = recipient;
            if DkgErrorSimulation::should_fault(self.faults.justify_lie, rng) {
                point = (recipient + 1) % n;
                info!(recipient, "simulating corrupted justification");
            }
            let share = poly.evaluate(&self.member_ids[point]);
            revealed.push((recipient as u16, share.to_bytes()));
        }
        let body = Justification {
            header: self.header(),
            contributions: revealed,
        };
        self.justifications[self.my_index] = Some(body.clone());
        step.messages
            .push(DkgMessage::Justification(Signed::sign(body, &self.operator_key)?));
        self.note_session(|s| s.sent_justification = true);
        Ok(())
    }

    /// Quorum verification vector of a valid set; `None` if some member's vector is unknown
    fn quorum_vvec(&self, valid: &MemberSet) -> Option<VerificationVector> {
        let vvecs: Option<Vec<&VerificationVector>> = valid
            .iter_set()
            .map(|d| {
                self.contributions
                    .get(d)?
                    .as_ref()
                    .filter(|c| self.well_formed(c))
                    .map(|c| &c.vvec)
            })
            .collect();
        VerificationVector::aggregate(&vvecs?).ok()
    }

    /// Our key share for a valid set, checked against the quorum vector
    fn derive_key_share(&self, valid: &MemberSet, vvec: &VerificationVector) -> Option<SecretKey> {
        if !valid.get(self.my_index) {
            return None;
        }
        let shares: Option<Vec<&SecretKey>> = valid
            .iter_set()
            .map(|d| self.received_shares[d].as_ref())
            .collect();
        let sk = aggregate_secret_shares(shares?);
        let expected = vvec.public_share(&self.member_ids[self.my_index]).ok()?;
        (sk.public_key() == expected).then_some(sk)
    }

    fn verify_and_commit<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        step: &mut SessionStep,
    ) -> Result<()> {
        let n = self.n();
        for dealer in 0..n {
            let complainers = self.complaints_against[dealer].clone();
            if complainers.count() == 0 || self.bad.get(dealer) {
                continue;
            }
            let justified = match (&self.contributions[dealer], &self.justifications[dealer]) {
                (Some(c), Some(j)) => complainers.iter_set().all(|recipient| {
                    j.contribution_for(recipient).is_some_and(|share| {
                        verify_secret_share(&c.vvec, &self.member_ids[recipient], &share)
                    })
                }),
                _ => false,
            };
            if !justified {
                debug!(dealer, "complaint not justified");
                self.bad.set(dealer, true);
                self.note_member(dealer, |m| m.bad = true);
                continue;
            }
            if complainers.get(self.my_index) {
                self.received_shares[dealer] = self.justifications[dealer]
                    .as_ref()
                    .and_then(|j| j.contribution_for(self.my_index));
            }
        }

        let valid = MemberSet::from_bits(
            (0..n)
                .map(|d| self.contributions[d].is_some() && !self.bad.get(d))
                .collect(),
        );
        if valid.count() < self.params.threshold {
            return Err(LlmqError::no_quorum(format!(
                "{} valid members, need {}",
                valid.count(),
                self.params.threshold
            )));
        }
        let vvec = self
            .quorum_vvec(&valid)
            .ok_or_else(|| LlmqError::internal("valid member without verification vector"))?;
        let quorum_public_key = vvec
            .public_key()
            .ok_or_else(|| LlmqError::internal("empty quorum verification vector"))?;

        let Some(sk_share) = self.derive_key_share(&valid, &vvec) else {
            debug!(
                valid = valid.get(self.my_index),
                "no key share, not sending premature commitment"
            );
            return Ok(());
        };
        if DkgErrorSimulation::should_fault(self.faults.commit_omit, rng) {
            info!(quorum_hash = %self.quorum_hash.short(), "simulating omitted commitment");
            return Ok(());
        }

        let mut claimed = valid;
        if DkgErrorSimulation::should_fault(self.faults.commit_lie, rng) {
            let victim = (self.my_index + 1) % n;
            claimed.set(victim, !claimed.get(victim));
            info!(victim, "simulating corrupted commitment");
        }
        let quorum_vvec_hash = vvec.hash();
        let hash = commitment_hash(
            self.params.llmq_type,
            &self.quorum_hash,
            &claimed,
            &quorum_public_key,
            &quorum_vvec_hash,
        );
        let premature = PrematureCommitment {
            header: self.header(),
            valid_members: claimed,
            quorum_public_key,
            quorum_vvec_hash,
            quorum_sig: sk_share.sign(&hash),
            member_sig: self.operator_key.sign(&hash),
        };

        self.prematures[self.my_index] = Some(premature.clone());
        step.messages.push(DkgMessage::PrematureCommitment(premature));
        self.note_session(|s| s.sent_premature_commitment = true);
        Ok(())
    }

    /// Check a premature commitment against our view of the dealt vectors
    fn check_premature(&self, from: usize, p: &PrematureCommitment) -> Option<VerificationVector> {
        if p.valid_members.len() != self.n()
            || p.valid_members.count() < self.params.threshold
            || !p.valid_members.get(from)
        {
            return None;
        }
        let vvec = self.quorum_vvec(&p.valid_members)?;
        if vvec.hash() != p.quorum_vvec_hash || vvec.public_key() != Some(p.quorum_public_key) {
            return None;
        }
        let share = vvec.public_share(&self.member_ids[from]).ok()?;
        p.quorum_sig
            .verify(&share, &p.commitment_hash())
            .then_some(vvec)
    }

    fn finalize(&mut self, step: &mut SessionStep) -> Result<()> {
        struct Group<'a> {
            first: &'a PrematureCommitment,
            vvec: VerificationVector,
            signers: Vec<usize>,
        }

        let mut groups: BTreeMap<Hash32, Group<'_>> = BTreeMap::new();
        for (from, premature) in self.prematures.iter().enumerate() {
            let Some(p) = premature else { continue };
            let Some(vvec) = self.check_premature(from, p) else {
                warn!(member = from, "invalid premature commitment");
                continue;
            };
            groups
                .entry(p.commitment_hash())
                .or_insert_with(|| Group {
                    first: p,
                    vvec,
                    signers: Vec::new(),
                })
                .signers
                .push(from);
        }

        let mut best: Option<(&Hash32, &Group<'_>)> = None;
        for (hash, group) in &groups {
            if best.map_or(true, |(_, b)| group.signers.len() > b.signers.len()) {
                best = Some((hash, group));
            }
        }
        let Some((hash, group)) = best.filter(|(_, g)| g.signers.len() >= self.params.threshold)
        else {
            return Err(LlmqError::no_quorum(format!(
                "largest agreeing set has {} signers, need {}",
                best.map_or(0, |(_, g)| g.signers.len()),
                self.params.threshold
            )));
        };

        let shares: Vec<(MemberId, Signature)> = group
            .signers
            .iter()
            .filter_map(|s| Some((self.member_ids[*s], self.prematures[*s].as_ref()?.quorum_sig)))
            .collect();
        let quorum_sig = recover_signature(&shares, self.params.threshold)?;
        let members_sig = Signature::aggregate(
            group
                .signers
                .iter()
                .filter_map(|s| self.prematures[*s].as_ref().map(|p| &p.member_sig)),
        )
        .ok_or_else(|| LlmqError::internal("no member signatures"))?;

        let n = self.n();
        let mut signers = MemberSet::new(n);
        for s in &group.signers {
            signers.set(*s, true);
        }
        let commitment = FinalCommitment {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum_hash,
            quorum_index: self.quorum_index,
            signers,
            valid_members: group.first.valid_members.clone(),
            quorum_public_key: Some(group.first.quorum_public_key),
            quorum_vvec_hash: group.first.quorum_vvec_hash,
            quorum_sig: Some(quorum_sig),
            members_sig: Some(members_sig),
        };
        commitment.verify(&self.params, &self.members)?;

        let key_share = self
            .derive_key_share(&commitment.valid_members, &group.vvec)
            .map(|secret_share| LocalKeyShare {
                quorum_public_key: group.first.quorum_public_key,
                vvec: group.vvec.clone(),
                secret_share,
                valid_members: commitment.valid_members.clone(),
            });

        info!(
            llmq_type = %self.params.llmq_type,
            quorum_hash = %self.quorum_hash.short(),
            commitment = %hash.short(),
            valid = commitment.valid_members.count(),
            signers = commitment.signers.count(),
            member = key_share.is_some(),
            "dkg session finalized"
        );
        self.phase = DkgPhase::Finalized;
        self.polynomial = None;
        self.note_session(|s| s.phase = DkgPhase::Finalized);
        step.outcome = Some(DkgOutcome::Finalized {
            commitment,
            key_share,
        });
        Ok(())
    }

    /// Last phase in which a message kind is still processed
    fn accepting_until(msg: &DkgMessage) -> DkgPhase {
        match msg {
            DkgMessage::Contribution(_) => DkgPhase::Contribute,
            DkgMessage::Complaint(_) => DkgPhase::Complain,
            DkgMessage::Justification(_) => DkgPhase::Justify,
            DkgMessage::PrematureCommitment(_) => DkgPhase::Commit,
        }
    }

    /// Accept a message from a committee member.
    ///
    /// Returns `Ok(false)` for late or duplicate messages. Messages from
    /// outside the committee or with a bad operator signature are
    /// `Protocol` errors.
    pub fn receive(&mut self, msg: DkgMessage) -> Result<bool> {
        let header = *msg.header();
        if header.llmq_type != self.params.llmq_type || header.quorum_hash != self.quorum_hash {
            return Err(LlmqError::invalid("message for another session"));
        }
        let from = header.member_index as usize;
        let Some(sender) = self.members.get(from) else {
            return Err(LlmqError::protocol(format!(
                "{} from member index {from} outside the committee",
                msg.kind()
            )));
        };
        if !msg.verify(&sender.operator_public_key)? {
            return Err(LlmqError::protocol(format!(
                "{} from member {from} has an invalid signature",
                msg.kind()
            )));
        }
        if from == self.my_index {
            return Ok(false);
        }
        if self.phase.is_terminal() || self.phase > Self::accepting_until(&msg) {
            debug!(kind = msg.kind(), member = from, phase = ?self.phase, "late dkg message");
            return Ok(false);
        }

        let fresh = match msg {
            DkgMessage::Contribution(m) => {
                let slot = &mut self.contributions[from];
                let fresh = slot.is_none();
                if fresh {
                    *slot = Some(m.body);
                }
                self.note_member(from, |s| s.received_contribution = true);
                fresh
            }
            DkgMessage::Complaint(m) => {
                let slot = &mut self.complaints[from];
                let fresh = slot.is_none();
                if fresh {
                    *slot = Some(m.body);
                }
                self.note_member(from, |s| s.received_complaint = true);
                fresh
            }
            DkgMessage::Justification(m) => {
                let slot = &mut self.justifications[from];
                let fresh = slot.is_none();
                if fresh {
                    *slot = Some(m.body);
                }
                self.note_member(from, |s| s.received_justification = true);
                fresh
            }
            DkgMessage::PrematureCommitment(m) => {
                let slot = &mut self.prematures[from];
                let fresh = slot.is_none();
                if fresh {
                    *slot = Some(m);
                }
                self.note_member(from, |s| s.received_premature_commitment = true);
                fresh
            }
        };
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_core::{sha256d, PeerId};

    struct Committee {
        params: LlmqParams,
        locals: Vec<LocalMasternode>,
        members: Vec<MasternodeEntry>,
    }

    fn committee(size: usize) -> Committee {
        let mut params = LlmqParams::preset(LlmqType::LlmqTest);
        params.size = size;
        params.min_size = 3;
        params.threshold = 3;
        params.dkg_bad_votes_threshold = size;
        let locals: Vec<LocalMasternode> = (0..size as u8)
            .map(|i| LocalMasternode {
                pro_tx_hash: sha256d(&[b'm', i]),
                operator_key: SecretKey::from_seed(&[b'o', i]).unwrap(),
            })
            .collect();
        let members = locals
            .iter()
            .enumerate()
            .map(|(i, l)| MasternodeEntry {
                pro_tx_hash: l.pro_tx_hash,
                operator_public_key: l.operator_key.public_key(),
                peer: PeerId(i as u64),
            })
            .collect();
        Committee {
            params,
            locals,
            members,
        }
    }

    /// Run every member's session through the schedule, delivering all messages in between
    fn run(c: &Committee, faults: impl Fn(usize) -> DkgErrorSimulation) -> Vec<DkgOutcome> {
        let base = 24;
        let quorum_hash = sha256d(b"base");
        let diag = Arc::new(DkgDiagnostics::new());
        let mut sessions: Vec<DkgSession> = c
            .locals
            .iter()
            .enumerate()
            .map(|(i, local)| {
                DkgSession::new(
                    c.params.clone(),
                    0,
                    quorum_hash,
                    base,
                    c.members.clone(),
                    local,
                    faults(i),
                    Arc::clone(&diag),
                )
                .unwrap()
            })
            .collect();
        let mut outcomes: Vec<Option<DkgOutcome>> = sessions.iter().map(|_| None).collect();
        let mut rng = rand::thread_rng();
        for height in base..base + 14 {
            let mut outbound = Vec::new();
            for (i, s) in sessions.iter_mut().enumerate() {
                let step = s.advance(height, &mut rng);
                outbound.extend(step.messages);
                if let Some(o) = step.outcome {
                    outcomes[i] = Some(o);
                }
            }
            for msg in outbound {
                for s in sessions.iter_mut() {
                    s.receive(msg.clone()).unwrap();
                }
            }
        }
        outcomes.into_iter().map(Option::unwrap).collect()
    }

    fn finalized(o: &DkgOutcome) -> (&FinalCommitment, Option<&LocalKeyShare>) {
        match o {
            DkgOutcome::Finalized {
                commitment,
                key_share,
            } => (commitment, key_share.as_ref()),
            DkgOutcome::Failed(reason) => panic!("session failed: {reason}"),
        }
    }

    #[test]
    fn test_honest_committee_agrees() {
        let c = committee(5);
        let outcomes = run(&c, |_| DkgErrorSimulation::default());
        let (first, _) = finalized(&outcomes[0]);
        assert_eq!(first.valid_members.count(), 5);
        for o in &outcomes {
            let (commitment, share) = finalized(o);
            assert_eq!(commitment.quorum_public_key, first.quorum_public_key);
            assert!(share.is_some());
        }
        first.verify(&c.params, &c.members).unwrap();
    }

    #[test]
    fn test_key_shares_recover_quorum_signature() {
        let c = committee(5);
        let outcomes = run(&c, |_| DkgErrorSimulation::default());
        let (commitment, _) = finalized(&outcomes[0]);
        let msg = sha256d(b"request");
        let shares: Vec<(MemberId, Signature)> = outcomes
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, o)| {
                let share = finalized(o).1.unwrap();
                (
                    member_scalar(&c.members[i].pro_tx_hash).unwrap(),
                    share.secret_share.sign(&msg),
                )
            })
            .collect();
        let sig = recover_signature(&shares, 3).unwrap();
        assert!(sig.verify(&commitment.quorum_public_key.unwrap(), &msg));
    }

    #[test]
    fn test_unjustified_liar_is_excluded() {
        let c = committee(5);
        let outcomes = run(&c, |i| {
            if i == 4 {
                DkgErrorSimulation {
                    contribution_lie: 1.0,
                    justify_omit: 1.0,
                    ..Default::default()
                }
            } else {
                DkgErrorSimulation::default()
            }
        });
        let (commitment, _) = finalized(&outcomes[0]);
        assert_eq!(commitment.valid_members.count(), 4);
        assert!(!commitment.valid_members.get(4));
        assert!(finalized(&outcomes[4]).1.is_none());
    }

    #[test]
    fn test_justified_liar_stays_valid() {
        let c = committee(5);
        let outcomes = run(&c, |i| {
            if i == 2 {
                DkgErrorSimulation {
                    contribution_lie: 1.0,
                    ..Default::default()
                }
            } else {
                DkgErrorSimulation::default()
            }
        });
        for o in &outcomes {
            assert_eq!(finalized(o).0.valid_members.count(), 5);
        }
    }

    #[test]
    fn test_too_many_omissions_fail() {
        let c = committee(5);
        let outcomes = run(&c, |i| DkgErrorSimulation {
            contribution_omit: if i < 3 { 1.0 } else { 0.0 },
            ..Default::default()
        });
        for o in outcomes {
            assert!(matches!(o, DkgOutcome::Failed(_)));
        }
    }

    #[test]
    fn test_threshold_valid_members_finalize_below_min_size() {
        let mut c = committee(5);
        c.params.min_size = 4;
        let outcomes = run(&c, |i| DkgErrorSimulation {
            contribution_omit: if i < 2 { 1.0 } else { 0.0 },
            ..Default::default()
        });
        for (i, o) in outcomes.iter().enumerate() {
            let (commitment, share) = finalized(o);
            assert_eq!(commitment.valid_members.count(), 3);
            assert_eq!(commitment.signers.count(), 3);
            assert_eq!(share.is_some(), i >= 2);
        }
        finalized(&outcomes[2]).0.verify(&c.params, &c.members).unwrap();

        let mut larger = c.params.clone();
        larger.size = 6;
        larger.min_size = 6;
        assert!(finalized(&outcomes[2]).0.verify(&larger, &c.members).is_err());
    }

    #[test]
    fn test_commit_liar_is_not_a_signer() {
        let c = committee(5);
        let outcomes = run(&c, |i| DkgErrorSimulation {
            commit_lie: if i == 1 { 1.0 } else { 0.0 },
            ..Default::default()
        });
        let (commitment, _) = finalized(&outcomes[0]);
        assert_eq!(commitment.valid_members.count(), 5);
        assert_eq!(commitment.signers.count(), 4);
        assert!(!commitment.signers.get(1));
    }

    #[test]
    fn test_rejects_forged_sender() {
        let c = committee(3);
        let diag = Arc::new(DkgDiagnostics::new());
        let mut session = DkgSession::new(
            c.params.clone(),
            0,
            sha256d(b"base"),
            24,
            c.members.clone(),
            &c.locals[0],
            DkgErrorSimulation::default(),
            diag,
        )
        .unwrap();
        let body = Complaint {
            header: DkgHeader {
                llmq_type: c.params.llmq_type,
                quorum_hash: sha256d(b"base"),
                member_index: 1,
            },
            bad_members: MemberSet::new(3),
            complaints: MemberSet::new(3),
        };
        // Signed by member 2 but claims to be member 1.
        let forged = DkgMessage::Complaint(Signed::sign(body, &c.locals[2].operator_key).unwrap());
        let err = session.receive(forged).unwrap_err();
        assert!(err.is_peer_fault());
    }
}
