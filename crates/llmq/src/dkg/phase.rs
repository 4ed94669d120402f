//! DKG phases and the block-height clock that drives them

use llmq_core::{BlockHeight, LlmqParams};
use serde::{Deserialize, Serialize};

/// Phase of a DKG session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DkgPhase {
    /// Session created, waiting for the contribute phase
    Initialized,
    /// Dealing contributions
    Contribute,
    /// Checking contributions, complaining about bad ones
    Complain,
    /// Revealing disputed contributions
    Justify,
    /// Deriving the quorum key and sending premature commitments
    Commit,
    /// Aggregating premature commitments into the final commitment
    Finalize,
    /// A final commitment was produced
    Finalized,
    /// The session could not produce a quorum
    Failed,
}

impl DkgPhase {
    /// Phases driven by the block clock, in order
    pub const SCHEDULED: [DkgPhase; 6] = [
        DkgPhase::Initialized,
        DkgPhase::Contribute,
        DkgPhase::Complain,
        DkgPhase::Justify,
        DkgPhase::Commit,
        DkgPhase::Finalize,
    ];

    /// Whether the session is over
    pub fn is_terminal(self) -> bool {
        matches!(self, DkgPhase::Finalized | DkgPhase::Failed)
    }

    /// Phase following a scheduled phase
    pub fn next(self) -> Option<DkgPhase> {
        let pos = Self::SCHEDULED.iter().position(|p| *p == self)?;
        Self::SCHEDULED.get(pos + 1).copied()
    }

    /// Scheduled phase at `height` for a session based at `base_height`;
    /// `None` once the schedule has run out.
    pub fn at_height(params: &LlmqParams, base_height: BlockHeight, height: BlockHeight) -> Option<DkgPhase> {
        if height < base_height {
            return Some(DkgPhase::Initialized);
        }
        let index = (height - base_height) / params.dkg_phase_blocks;
        Self::SCHEDULED.get(index as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_core::LlmqType;

    #[test]
    fn test_phase_schedule() {
        let params = LlmqParams::preset(LlmqType::LlmqTest);
        assert_eq!(DkgPhase::at_height(&params, 24, 24), Some(DkgPhase::Initialized));
        assert_eq!(DkgPhase::at_height(&params, 24, 27), Some(DkgPhase::Contribute));
        assert_eq!(DkgPhase::at_height(&params, 24, 28), Some(DkgPhase::Complain));
        assert_eq!(DkgPhase::at_height(&params, 24, 34), Some(DkgPhase::Finalize));
        assert_eq!(DkgPhase::at_height(&params, 24, 36), None);
    }

    #[test]
    fn test_phases_only_move_forward() {
        let mut phase = DkgPhase::Initialized;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            phase = next;
            seen.push(phase);
        }
        assert_eq!(seen, DkgPhase::SCHEDULED.to_vec());
        assert!(DkgPhase::Failed.is_terminal());
        assert!(!DkgPhase::Commit.is_terminal());
    }
}
