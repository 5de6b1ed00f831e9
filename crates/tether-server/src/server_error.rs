//! Driver error types.
//!
//! Errors raised while the driver routes events between channels and
//! sessions. A driver error is always scoped to one channel or session; the
//! event loop logs it and keeps serving everyone else.

use std::fmt;

use crate::manager::ManagerError;

/// Errors that can occur while processing a [`ServerEvent`](crate::ServerEvent).
#[derive(Debug)]
pub enum ServerError {
    /// Channel not found in the driver.
    ///
    /// An event arrived for a channel that already closed. Transient: the
    /// reader task and the driver raced on shutdown.
    ChannelNotFound(u64),

    /// Channel id already in use.
    ///
    /// The runtime hands out channel ids monotonically, so this is a logic
    /// bug. Fatal - report as issue.
    ChannelAlreadyExists(u64),

    /// The remote runtime for a new session could not be started.
    ///
    /// The session was closed again; nothing else is affected.
    Launch(std::io::Error),

    /// Session manager operation failed.
    ///
    /// Wraps errors from `SessionManager` (unknown app, duplicate attach).
    /// See `ManagerError` for details.
    Manager(ManagerError),

    /// The peer broke the handshake.
    ///
    /// Fatal for that channel; the server keeps serving others.
    Protocol(String),
}

impl ServerError {
    /// Returns true if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ChannelNotFound(_))
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelNotFound(id) => write!(f, "channel not found: {id}"),
            Self::ChannelAlreadyExists(id) => write!(f, "channel already exists: {id}"),
            Self::Launch(err) => write!(f, "could not launch runtime: {err}"),
            Self::Manager(err) => write!(f, "session manager error: {err}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Manager(err) => Some(err),
            Self::Launch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ManagerError> for ServerError {
    fn from(err: ManagerError) -> Self {
        Self::Manager(err)
    }
}

impl From<tether_proto::ProtocolError> for ServerError {
    fn from(err: tether_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}
