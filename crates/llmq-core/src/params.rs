//! Per-type quorum parameters
//!
//! A DKG window for a type opens every `dkg_interval` blocks. Inside the
//! window each protocol phase lasts `dkg_phase_blocks`; the final commitment
//! may be mined at offsets `dkg_mining_window_start..=dkg_mining_window_end`
//! from the window's base height.

use crate::errors::{LlmqError, Result};
use crate::types::{BlockHeight, LlmqType};
use serde::{Deserialize, Serialize};

/// Number of DKG phases that consume blocks (Initialized through Finalize)
pub const DKG_PHASE_COUNT: u32 = 6;

/// Parameters of one quorum type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmqParams {
    /// The type these parameters apply to
    pub llmq_type: LlmqType,
    /// Committee size
    pub size: usize,
    /// Smallest committee a DKG session runs with
    pub min_size: usize,
    /// Number of shares needed to recover a signature
    pub threshold: usize,
    /// Blocks between DKG windows
    pub dkg_interval: u32,
    /// Blocks per DKG phase
    pub dkg_phase_blocks: u32,
    /// First offset at which the final commitment may be mined
    pub dkg_mining_window_start: u32,
    /// Last offset at which the final commitment may be mined
    pub dkg_mining_window_end: u32,
    /// Complaints needed to mark a member bad without justification
    pub dkg_bad_votes_threshold: usize,
    /// Number of recent quorums that sign
    pub signing_active_quorum_count: usize,
    /// Number of quorums retained by the registry
    pub keep_old_quorums: usize,
    /// Members asked for shares when recovering on behalf of others
    pub recovery_members: usize,
    /// Quorums formed per DKG window
    #[serde(default = "default_quorums_per_window")]
    pub quorums_per_window: u32,
}

fn default_quorums_per_window() -> u32 {
    1
}

impl LlmqParams {
    /// Production and test presets
    pub fn preset(llmq_type: LlmqType) -> Self {
        let p = |size, min_size, threshold, interval, phase, start, end, bad, active, keep, recovery| {
            LlmqParams {
                llmq_type,
                size,
                min_size,
                threshold,
                dkg_interval: interval,
                dkg_phase_blocks: phase,
                dkg_mining_window_start: start,
                dkg_mining_window_end: end,
                dkg_bad_votes_threshold: bad,
                signing_active_quorum_count: active,
                keep_old_quorums: keep,
                recovery_members: recovery,
                quorums_per_window: 1,
            }
        };
        match llmq_type {
            LlmqType::Llmq50_60 => p(50, 40, 30, 24, 2, 10, 18, 40, 24, 25, 25),
            LlmqType::Llmq400_60 => p(400, 300, 240, 288, 4, 20, 28, 300, 4, 5, 100),
            LlmqType::Llmq400_85 => p(400, 350, 340, 576, 4, 20, 48, 300, 4, 5, 100),
            LlmqType::Llmq100_67 => p(100, 80, 67, 24, 2, 10, 18, 80, 24, 25, 50),
            LlmqType::LlmqTest => p(3, 2, 2, 24, 2, 10, 18, 2, 2, 3, 3),
            LlmqType::LlmqDevnet => p(12, 7, 6, 24, 2, 10, 18, 7, 4, 4, 6),
            LlmqType::LlmqTestInstantSend => p(3, 2, 2, 24, 2, 10, 18, 2, 2, 3, 3),
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        let name = self.llmq_type;
        if self.threshold == 0 || self.threshold > self.min_size || self.min_size > self.size {
            return Err(LlmqError::config(format!(
                "{name}: require 0 < threshold <= min_size <= size"
            )));
        }
        if self.dkg_phase_blocks == 0 {
            return Err(LlmqError::config(format!("{name}: dkg_phase_blocks is zero")));
        }
        let finalize_offset = self.dkg_phase_blocks * (DKG_PHASE_COUNT - 1);
        if self.dkg_mining_window_start < finalize_offset {
            return Err(LlmqError::config(format!(
                "{name}: mining window opens before the finalize phase"
            )));
        }
        if self.dkg_mining_window_end < self.dkg_mining_window_start
            || self.dkg_mining_window_end >= self.dkg_interval
        {
            return Err(LlmqError::config(format!(
                "{name}: mining window must be ordered and end inside the interval"
            )));
        }
        if self.signing_active_quorum_count == 0
            || self.keep_old_quorums < self.signing_active_quorum_count
        {
            return Err(LlmqError::config(format!(
                "{name}: keep_old_quorums must cover the active signing set"
            )));
        }
        if self.quorums_per_window == 0 {
            return Err(LlmqError::config(format!("{name}: quorums_per_window is zero")));
        }
        Ok(())
    }

    /// Whether `height` opens a DKG window
    pub fn is_window_start(&self, height: BlockHeight) -> bool {
        height % self.dkg_interval == 0
    }

    /// Base height of the window containing `height`
    pub fn window_base(&self, height: BlockHeight) -> BlockHeight {
        height - height % self.dkg_interval
    }

    /// Whether a commitment for the window based at `base` may be mined at `height`
    pub fn in_mining_window(&self, base: BlockHeight, height: BlockHeight) -> bool {
        height >= base
            && (height - base) >= self.dkg_mining_window_start
            && (height - base) <= self.dkg_mining_window_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for t in LlmqType::ALL {
            LlmqParams::preset(t).validate().unwrap();
        }
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut p = LlmqParams::preset(LlmqType::LlmqTest);
        p.threshold = 4;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_mining_window() {
        let p = LlmqParams::preset(LlmqType::LlmqTest);
        assert!(p.is_window_start(48));
        assert_eq!(p.window_base(59), 48);
        assert!(!p.in_mining_window(48, 57));
        assert!(p.in_mining_window(48, 58));
        assert!(p.in_mining_window(48, 66));
        assert!(!p.in_mining_window(48, 67));
    }
}
