//! Subsystem configuration
//!
//! `LlmqConfig` is built once by the hosting process (usually from TOML) and
//! passed by reference to every component constructor. It is validated
//! before any component exists, so components may rely on its invariants.

use crate::errors::{LlmqError, Result};
use crate::params::LlmqParams;
use crate::types::LlmqType;
use serde::{Deserialize, Serialize};

/// Fault injection rates for DKG on test networks.
///
/// A rate is the probability that the local node misbehaves in that way at
/// the corresponding step. Rates of exactly 0 or 1 are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DkgErrorSimulation {
    /// Skip sending contributions
    pub contribution_omit: f64,
    /// Send a corrupted secret contribution to a recipient
    pub contribution_lie: f64,
    /// Complain about a member that sent a valid contribution
    pub complain_lie: f64,
    /// Reveal a corrupted contribution when justifying
    pub justify_lie: f64,
    /// Skip justification
    pub justify_omit: f64,
    /// Skip the premature commitment
    pub commit_omit: f64,
    /// Commit to a corrupted valid-member set
    pub commit_lie: f64,
}

impl DkgErrorSimulation {
    fn rates(&self) -> [(&'static str, f64); 7] {
        [
            ("contribution_omit", self.contribution_omit),
            ("contribution_lie", self.contribution_lie),
            ("complain_lie", self.complain_lie),
            ("justify_lie", self.justify_lie),
            ("justify_omit", self.justify_omit),
            ("commit_omit", self.commit_omit),
            ("commit_lie", self.commit_lie),
        ]
    }

    /// Whether any fault is enabled
    pub fn is_active(&self) -> bool {
        self.rates().iter().any(|(_, r)| *r > 0.0)
    }

    /// Roll for a fault at the given rate
    pub fn should_fault(rate: f64, rng: &mut impl rand::Rng) -> bool {
        if rate <= 0.0 {
            false
        } else if rate >= 1.0 {
            true
        } else {
            rng.gen_bool(rate)
        }
    }
}

/// Configuration of the whole LLMQ subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmqConfig {
    /// Enabled quorum types and their parameters
    pub params: Vec<LlmqParams>,
    /// Type whose quorums sign chain locks
    pub chain_locks_type: LlmqType,
    /// Type whose quorums sign instant locks
    pub instant_send_type: LlmqType,
    /// Type whose quorums sign upgrade signals
    pub upgrade_signal_type: LlmqType,
    /// Blocks after which an unrecovered signing request expires
    pub sig_share_expiry_blocks: u32,
    /// Blocks a recovered signature is retained
    pub recovered_sig_retention_blocks: u32,
    /// Bound on every worker queue
    pub worker_queue_capacity: usize,
    /// Threads in the shared BLS verification pool
    pub bls_worker_threads: usize,
    /// Number of forwarded upgrade-signal hashes remembered
    pub upgrade_signal_dedup_window: usize,
    /// Quorums are selected from the set active this many blocks below the sign height
    pub sign_height_offset: u32,
    /// DKG fault injection, for test networks only
    pub dkg_error_simulation: DkgErrorSimulation,
}

impl Default for LlmqConfig {
    fn default() -> Self {
        Self {
            params: vec![
                LlmqParams::preset(LlmqType::Llmq50_60),
                LlmqParams::preset(LlmqType::Llmq400_60),
                LlmqParams::preset(LlmqType::Llmq400_85),
            ],
            chain_locks_type: LlmqType::Llmq400_60,
            instant_send_type: LlmqType::Llmq50_60,
            upgrade_signal_type: LlmqType::Llmq400_85,
            sig_share_expiry_blocks: 8,
            recovered_sig_retention_blocks: 576,
            worker_queue_capacity: 1024,
            bls_worker_threads: 2,
            upgrade_signal_dedup_window: 64,
            sign_height_offset: 8,
            dkg_error_simulation: DkgErrorSimulation::default(),
        }
    }
}

impl LlmqConfig {
    /// Single-type configuration for regression networks: every topic signs
    /// with the given parameters.
    pub fn single_type(params: LlmqParams) -> Self {
        let t = params.llmq_type;
        Self {
            params: vec![params],
            chain_locks_type: t,
            instant_send_type: t,
            upgrade_signal_type: t,
            recovered_sig_retention_blocks: 48,
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: LlmqConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parameters of an enabled type
    pub fn params_for(&self, llmq_type: LlmqType) -> Option<&LlmqParams> {
        self.params.iter().find(|p| p.llmq_type == llmq_type)
    }

    /// Parameters of an enabled type, or a `Config` error
    pub fn require_params(&self, llmq_type: LlmqType) -> Result<&LlmqParams> {
        self.params_for(llmq_type)
            .ok_or_else(|| LlmqError::config(format!("llmq type {llmq_type} is not enabled")))
    }

    /// Check every invariant components rely on
    pub fn validate(&self) -> Result<()> {
        if self.params.is_empty() {
            return Err(LlmqError::config("no llmq types enabled"));
        }
        for (i, p) in self.params.iter().enumerate() {
            p.validate()?;
            if self.params[..i].iter().any(|q| q.llmq_type == p.llmq_type) {
                return Err(LlmqError::config(format!(
                    "llmq type {} configured twice",
                    p.llmq_type
                )));
            }
        }
        for t in [
            self.chain_locks_type,
            self.instant_send_type,
            self.upgrade_signal_type,
        ] {
            self.require_params(t)?;
        }
        if self.sig_share_expiry_blocks == 0 {
            return Err(LlmqError::config("sig_share_expiry_blocks must be positive"));
        }
        if self.recovered_sig_retention_blocks < self.sig_share_expiry_blocks {
            return Err(LlmqError::config(
                "recovered_sig_retention_blocks must not be shorter than share expiry",
            ));
        }
        if self.worker_queue_capacity == 0 || self.bls_worker_threads == 0 {
            return Err(LlmqError::config(
                "worker_queue_capacity and bls_worker_threads must be positive",
            ));
        }
        if self.upgrade_signal_dedup_window == 0 {
            return Err(LlmqError::config("upgrade_signal_dedup_window must be positive"));
        }
        for (name, rate) in self.dkg_error_simulation.rates() {
            if !(0.0..=1.0).contains(&rate) {
                return Err(LlmqError::config(format!(
                    "dkg_error_simulation.{name} must be within [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        LlmqConfig::default().validate().unwrap();
        LlmqConfig::single_type(LlmqParams::preset(LlmqType::LlmqTest))
            .validate()
            .unwrap();
    }

    #[test]
    fn test_from_toml() {
        let doc = r#"
            chain_locks_type = "llmq_test"
            instant_send_type = "llmq_test"
            upgrade_signal_type = "llmq_test"
            sig_share_expiry_blocks = 4

            [[params]]
            llmq_type = "llmq_test"
            size = 5
            min_size = 3
            threshold = 3
            dkg_interval = 24
            dkg_phase_blocks = 2
            dkg_mining_window_start = 10
            dkg_mining_window_end = 18
            dkg_bad_votes_threshold = 5
            signing_active_quorum_count = 2
            keep_old_quorums = 3
            recovery_members = 3

            [dkg_error_simulation]
            contribution_omit = 1.0
        "#;
        let config = LlmqConfig::from_toml_str(doc).unwrap();
        assert_eq!(config.sig_share_expiry_blocks, 4);
        assert_eq!(config.require_params(LlmqType::LlmqTest).unwrap().size, 5);
        assert!(config.dkg_error_simulation.is_active());
    }

    #[test]
    fn test_unknown_topic_type_rejected() {
        let mut config = LlmqConfig::single_type(LlmqParams::preset(LlmqType::LlmqTest));
        config.chain_locks_type = LlmqType::Llmq400_60;
        assert_matches!(config.validate(), Err(LlmqError::Config { .. }));
    }

    #[test]
    fn test_rate_out_of_range_rejected() {
        let mut config = LlmqConfig::single_type(LlmqParams::preset(LlmqType::LlmqTest));
        config.dkg_error_simulation.justify_lie = 1.5;
        assert_matches!(config.validate(), Err(LlmqError::Config { .. }));
    }
}
