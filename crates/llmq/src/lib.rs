//! LLMQ - long-living masternode quorums
//!
//! Quorum formation through a block-height driven DKG, and threshold signing
//! on top of the formed quorums for chain locks, instant locks and upgrade
//! signals.
//!
//! # Components
//!
//! - `commitment`: final commitments and the ledger of mined ones
//! - `dkg`: the distributed key generation sessions and their coordinator
//! - `quorums`: the registry of active quorums and signing-quorum selection
//! - `signing`: signing requests and recovered signatures
//! - `shares`: signature share exchange and recovery
//! - `chainlocks`, `instantsend`, `ehf`: the signature consumers
//! - `context`: `LlmqContext`, which owns all of the above
//!
//! # Threads
//!
//! Each stateful service drains a bounded queue on its own thread
//! (`worker::Worker`). Block ticks are queued with blocking sends so they are
//! never dropped; peer messages are dropped when a queue is full. Signature
//! verification runs on the shared `BlsWorker` pool.

#![forbid(unsafe_code)]

pub mod bls_worker;
pub mod chainlocks;
pub mod commitment;
pub mod context;
pub mod dkg;
pub mod ehf;
pub mod instantsend;
pub mod interfaces;
pub mod messages;
pub mod quorums;
pub mod shares;
pub mod signing;
pub mod worker;

pub use chainlocks::{ChainLockHandler, ChainLockListener, ChainLockSig, ChainLockView};
pub use commitment::{CommitmentLedger, FinalCommitment, MinedCommitment};
pub use context::{LlmqContext, LlmqDependencies};
pub use dkg::{DkgCoordinator, DkgPhase};
pub use ehf::{UpgradeSignal, UpgradeSignalHandler};
pub use instantsend::{InstantLock, InstantLockHandler};
pub use interfaces::{
    Block, ChainView, ForkActivation, LocalMasternode, MasternodeEntry, MasternodeList,
    NetworkHandle, ValidationEngine,
};
pub use messages::LlmqMessage;
pub use quorums::{Quorum, QuorumRegistry};
pub use shares::{RequestState, ShareExchange, SigShare};
pub use signing::{
    ExpiredRequest, RecoveredLookup, RecoveredSig, RecoveredSigListener, SigningCoordinator,
};

pub use llmq_core::{LlmqConfig, LlmqError, LlmqParams, LlmqType, Result};
