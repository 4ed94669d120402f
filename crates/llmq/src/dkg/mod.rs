//! Distributed key generation
//!
//! Every `dkg_interval` blocks a committee picked by the masternode list
//! runs a Feldman-VSS based DKG to form a new quorum. The protocol is clocked
//! by block height only; a phase's action runs when its first block arrives,
//! whatever the messages received so far. Missing or malicious input makes
//! members bad, it never stalls the session.
//!
//! - `types`: wire messages, each signed with the sender's operator key
//! - `phase`: the phase schedule
//! - `session`: one member's state machine for one quorum
//! - `coordinator`: session ownership, the worker, network I/O
//! - `diagnostics`: passive per-session status
//! - `share_store`: secret key shares produced by finished sessions

mod coordinator;
pub mod diagnostics;
mod phase;
mod session;
mod share_store;
mod types;

pub use coordinator::{DkgCoordinator, DkgEvent};
pub use diagnostics::{DiagnosticsSnapshot, DkgDiagnostics, MemberStatus, SessionStatus};
pub use phase::DkgPhase;
pub use session::{DkgOutcome, DkgSession, SessionStep};
pub use share_store::{KeyShareStore, LocalKeyShare};
pub use types::{
    Complaint, Contribution, DkgHeader, DkgMessage, Justification, PrematureCommitment, Signed,
};
