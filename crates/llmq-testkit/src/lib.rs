//! LLMQ Testing Infrastructure
//!
//! In-process stand-ins for everything the subsystem consumes: a chain, a
//! masternode list, a loopback network and recording validation hooks, plus
//! a `Simulation` that runs several `LlmqContext`s against them.
//!
//! # Usage
//!
//! ```rust,no_run
//! use llmq_testkit::*;
//!
//! let sim = Simulation::builder(test_config()).masternodes(3).build().unwrap();
//! sim.start().unwrap();
//! sim.mine_until(45).unwrap();
//! assert_eq!(sim.node(0).ctx.registry().quorum_count(test_params().llmq_type), 1);
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod chain;
pub mod config;
pub mod masternodes;
pub mod network;
pub mod recorders;
pub mod simulation;
pub mod strategies;

pub use chain::MockChain;
pub use config::*;
pub use masternodes::{TestMasternode, TestMasternodeList};
pub use network::{LoopbackHub, LoopbackNetwork, Misbehavior};
pub use recorders::{RecordingForkActivation, RecordingValidation, ValidationEvent};
pub use simulation::{SimNode, Simulation, SimulationBuilder};

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once; filtered by `RUST_LOG`
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
