//! Error types for the tether core.
//!
//! One enum per concern: channel liveness, dependency resolution, the asset
//! store, sessions, and mirror objects. Errors that wrap another layer use
//! `#[from]` so callers can propagate with `?`.

use std::time::Duration;

use thiserror::Error;

use crate::{connection::ConnectionState, session::SessionStatus};

/// Errors from the channel liveness state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Invalid state transition attempted
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when error occurred
        state: ConnectionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// No `HELLO` arrived in time
    #[error("could not associate channel: no HELLO after {elapsed:?}")]
    HelloTimeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Too many pings went unanswered
    #[error("connection timed out (no pong after {missed} pings)")]
    PongTimeout {
        /// Consecutive unanswered pings
        missed: u32,
    },
}

impl ConnectionError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Timeouts are transient: the peer may simply reconnect. Misuse of the
    /// state machine is a driver bug and never transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HelloTimeout { .. } | Self::PongTimeout { .. })
    }
}

/// Errors from dependency resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The dependency graph has a cycle. `path` starts and ends with the same
    /// item.
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle {
        /// Items along the cycle
        path: Vec<String>,
    },

    /// Two input items share a name
    #[error("duplicate item name in resolution input: {0}")]
    DuplicateName(String),
}

/// Errors from the asset store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    /// An asset (or bundle) with this name already exists
    #[error("asset name already in use: {0}")]
    DuplicateAsset(String),

    /// A module with this name already exists
    #[error("module name already in use: {0}")]
    DuplicateModule(String),

    /// Another module already declares this class name
    #[error("class {class} is already declared by module {existing}")]
    DuplicateClass {
        /// Class name
        class: String,
        /// Module that declares it
        existing: String,
    },

    /// Shared data with this name already exists
    #[error("shared data name already in use: {0}")]
    DuplicateData(String),

    /// No module with this name
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// No asset or bundle with this name
    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    /// Name is empty or contains characters outside `[A-Za-z0-9_.-]`
    #[error("invalid name {name:?}: {reason}")]
    InvalidName {
        /// Offending name
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A module may not depend on itself
    #[error("module {0} cannot depend on itself")]
    SelfDependency(String),

    /// Fetching an external asset failed
    #[error("failed to fetch {name} from {reference}: {reason}")]
    Fetch {
        /// Asset name
        name: String,
        /// External reference
        reference: String,
        /// Underlying failure
        reason: String,
    },

    /// A lazy asset producer failed
    #[error("producer for {name} failed: {reason}")]
    Producer {
        /// Asset name
        name: String,
        /// Underlying failure
        reason: String,
    },

    /// The code generator rejected a class
    #[error("code generation for {class} failed: {reason}")]
    Generator {
        /// Class name
        class: String,
        /// Underlying failure
        reason: String,
    },

    /// Module ordering failed
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Errors from session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not valid in the current status
    #[error("cannot {operation} a {status:?} session")]
    InvalidState {
        /// Status when the operation was attempted
        status: SessionStatus,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// The session already has a peer; only one attach can win
    #[error("session {0} is already attached")]
    AlreadyAttached(String),

    /// Per-session data with this name already exists
    #[error("session data name already in use: {0}")]
    DuplicateData(String),

    /// A runtime handle is already attached
    #[error("session already has a runtime")]
    RuntimeAlreadySet,

    /// Asset delivery failed
    #[error(transparent)]
    Asset(#[from] AssetError),
}

/// Errors from mirror object operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    /// The class (and its bases) declare no attribute with this name
    #[error("{class} has no attribute {name}")]
    UnknownAttribute {
        /// Class name
        class: &'static str,
        /// Attribute name
        name: String,
    },

    /// Value rejected by the attribute's normalization rule
    #[error("invalid value for {attribute}: {reason}")]
    Validation {
        /// Attribute name
        attribute: String,
        /// Why the value was rejected
        reason: String,
    },

    /// A remote set targeted an attribute that never leaves the host
    #[error("attribute {0} is local and cannot be set remotely")]
    NotSynced(String),

    /// Object was disposed
    #[error("mirror {0} is disposed")]
    Disposed(String),

    /// Parent assignment would break the tree
    #[error("cannot parent {id}: {reason}")]
    InvalidParent {
        /// Child id
        id: String,
        /// Why the assignment was rejected
        reason: &'static str,
    },

    /// Object belongs to another session
    #[error("mirror {0} belongs to another session")]
    WrongSession(String),

    /// Session-level failure (closed session, asset delivery)
    #[error(transparent)]
    Session(#[from] SessionError),
}
