//! Passive record of local DKG session progress
//!
//! Nothing here feeds back into the protocol. Sessions report what they
//! sent, received and decided; operators read it as a JSON snapshot.

use super::phase::DkgPhase;
use chrono::{DateTime, Utc};
use llmq_core::{BlockHeight, Hash32, LlmqType};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// What the local node knows about one committee member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    /// Contribution received
    pub received_contribution: bool,
    /// Complaint received from this member
    pub received_complaint: bool,
    /// Justification received from this member
    pub received_justification: bool,
    /// Premature commitment received from this member
    pub received_premature_commitment: bool,
    /// We complained about this member
    pub we_complained: bool,
    /// Marked bad
    pub bad: bool,
    /// Number of members complaining about this member
    pub complaints_against: usize,
}

/// Status of the local session for one (type, quorum index)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// Quorum type
    pub llmq_type: LlmqType,
    /// Quorum index within the window
    pub quorum_index: u32,
    /// Base block hash
    pub quorum_hash: Hash32,
    /// Base block height
    pub base_height: BlockHeight,
    /// Local position in the committee
    pub my_index: usize,
    /// Current phase
    pub phase: DkgPhase,
    /// Contribution sent
    pub sent_contributions: bool,
    /// Complaint sent
    pub sent_complaint: bool,
    /// Justification sent
    pub sent_justification: bool,
    /// Premature commitment sent
    pub sent_premature_commitment: bool,
    /// Why the session failed
    pub failure: Option<String>,
    /// Per-member view
    pub members: Vec<MemberStatus>,
    /// Session creation time
    pub started_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time view of every local session
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Snapshot time
    pub taken_at: DateTime<Utc>,
    /// Sessions by type, then quorum index
    pub sessions: Vec<SessionStatus>,
}

impl DiagnosticsSnapshot {
    /// JSON rendering
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Recorder shared by all DKG sessions
#[derive(Default)]
pub struct DkgDiagnostics {
    sessions: RwLock<BTreeMap<(LlmqType, u32), SessionStatus>>,
}

impl DkgDiagnostics {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the status for a freshly started session
    pub fn init_local_session_status(
        &self,
        llmq_type: LlmqType,
        quorum_index: u32,
        quorum_hash: Hash32,
        base_height: BlockHeight,
        member_count: usize,
        my_index: usize,
    ) {
        let now = Utc::now();
        let status = SessionStatus {
            llmq_type,
            quorum_index,
            quorum_hash,
            base_height,
            my_index,
            phase: DkgPhase::Initialized,
            sent_contributions: false,
            sent_complaint: false,
            sent_justification: false,
            sent_premature_commitment: false,
            failure: None,
            members: vec![MemberStatus::default(); member_count],
            started_at: now,
            updated_at: now,
        };
        self.sessions.write().insert((llmq_type, quorum_index), status);
    }

    /// Apply an update to a session's status; unknown sessions are ignored
    pub fn update_local_session_status(
        &self,
        llmq_type: LlmqType,
        quorum_index: u32,
        update: impl FnOnce(&mut SessionStatus),
    ) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&(llmq_type, quorum_index)) {
            Some(status) => {
                update(status);
                status.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Apply an update to one member's status; unknown sessions or members are ignored
    pub fn update_local_member_status(
        &self,
        llmq_type: LlmqType,
        quorum_index: u32,
        member_index: usize,
        update: impl FnOnce(&mut MemberStatus),
    ) -> bool {
        let mut sessions = self.sessions.write();
        let Some(status) = sessions.get_mut(&(llmq_type, quorum_index)) else {
            return false;
        };
        let Some(member) = status.members.get_mut(member_index) else {
            return false;
        };
        update(member);
        status.updated_at = Utc::now();
        true
    }

    /// Status of one session
    pub fn session(&self, llmq_type: LlmqType, quorum_index: u32) -> Option<SessionStatus> {
        self.sessions.read().get(&(llmq_type, quorum_index)).cloned()
    }

    /// Copy of everything recorded
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            taken_at: Utc::now(),
            sessions: self.sessions.read().values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_and_member_updates() {
        let diag = DkgDiagnostics::new();
        assert!(!diag.update_local_session_status(LlmqType::LlmqTest, 0, |s| s.sent_complaint = true));

        diag.init_local_session_status(LlmqType::LlmqTest, 0, Hash32::ZERO, 24, 3, 1);
        assert!(diag.update_local_session_status(LlmqType::LlmqTest, 0, |s| {
            s.phase = DkgPhase::Contribute;
            s.sent_contributions = true;
        }));
        assert!(diag.update_local_member_status(LlmqType::LlmqTest, 0, 2, |m| m.bad = true));
        assert!(!diag.update_local_member_status(LlmqType::LlmqTest, 0, 7, |m| m.bad = true));

        let status = diag.session(LlmqType::LlmqTest, 0).unwrap();
        assert_eq!(status.phase, DkgPhase::Contribute);
        assert!(status.members[2].bad);
        assert!(!status.members[0].bad);
    }

    #[test]
    fn test_snapshot_serializes() {
        let diag = DkgDiagnostics::new();
        diag.init_local_session_status(LlmqType::LlmqTest, 0, Hash32::ZERO, 24, 2, 0);
        let json = diag.snapshot().to_json().unwrap();
        assert!(json.contains("\"llmq_type\": \"llmq_test\""));
        assert!(json.contains("\"phase\": \"Initialized\""));
    }
}
