//! Deterministic simulation harness for tether sessions.
//!
//! Everything a test needs to run host and remote side by side without
//! sockets or wall-clock time:
//!
//! - [`SimEnv`]: virtual clock and seeded RNG
//! - [`SimServer`]: `ServerDriver` over in-memory channels and virtual timers
//! - [`RemotePeer`]: scripted model of the remote runtime
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties that must hold once host and
//! remote are quiet: both sides hold the same objects with the same values,
//! and the object tree is consistent. Use [`InvariantRegistry::standard()`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod remote;
pub mod sim_env;
pub mod sim_server;

pub use invariants::{
    Invariant, InvariantRegistry, InvariantResult, ObjectSetAgreement, ObjectSnapshot, PropertyConvergence,
    SessionSnapshot, SystemSnapshot, TreeConsistency, Violation,
};
pub use remote::{RemoteObject, RemotePeer};
pub use sim_env::{SimEnv, SimInstant};
pub use sim_server::SimServer;
