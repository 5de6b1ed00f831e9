//! Channel liveness state machine.
//!
//! Tracks one duplex channel from accept to close: the `HELLO` deadline, the
//! heartbeat schedule, and missed-pong accounting. Uses the action pattern:
//! methods take time as input and return actions for the driver to execute.
//! The state machine never touches I/O and never owns a clock.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐  HELLO   ┌──────────┐
//! │ AwaitingHello│─────────>│ Attached │
//! └──────────────┘          └──────────┘
//!        │                        │
//!        │ hello timeout          │ pong timeout / close
//!        ↓                        ↓
//!   ┌────────┐               ┌────────┐
//!   │ Closed │<──────────────│ Closed │
//!   └────────┘               └────────┘
//! ```
//!
//! The ping counter itself belongs to the session (it doubles as the
//! keep-alive clock); this machine only decides *when* a ping is due.

use std::{ops::Sub, time::Duration};

use tether_proto::CloseCode;

use crate::error::ConnectionError;

/// Time allowed between accept and the first `HELLO`.
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between pings on an attached channel.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

/// Consecutive unanswered pings tolerated before the channel is closed.
pub const DEFAULT_MAX_MISSED_PONGS: u32 = 5;

/// Actions returned by the liveness state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Ask the session for its next `PING` and send it
    SendPing,

    /// Close the channel
    Close {
        /// Close code
        code: CloseCode,
        /// Human-readable reason
        reason: String,
    },
}

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, waiting for the peer's `HELLO`
    AwaitingHello,
    /// Bound to a session
    Attached,
    /// Closed (terminal)
    Closed,
}

/// Liveness configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed for the peer to send `HELLO`
    pub hello_timeout: Duration,
    /// Ping interval while attached
    pub heartbeat_interval: Duration,
    /// Unanswered pings tolerated before closing
    pub max_missed_pongs: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_pongs: DEFAULT_MAX_MISSED_PONGS,
        }
    }
}

/// Liveness state machine for one channel.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
#[derive(Debug, Clone)]
pub struct Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: ConnectionState,
    config: ConnectionConfig,
    opened_at: I,
    last_ping: Option<I>,
    /// Pings sent since the last pong
    missed: u32,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new connection in [`ConnectionState::AwaitingHello`].
    pub fn new(now: I, config: ConnectionConfig) -> Self {
        Self { state: ConnectionState::AwaitingHello, config, opened_at: now, last_ping: None, missed: 0 }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Pings sent since the last pong.
    pub fn missed_pongs(&self) -> u32 {
        self.missed
    }

    /// Bind the channel to a session after a successful `HELLO`.
    ///
    /// The first ping goes out one heartbeat interval later.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` unless awaiting `HELLO`
    pub fn attach(&mut self, now: I) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::AwaitingHello {
            return Err(ConnectionError::InvalidState { state: self.state, operation: "attach" });
        }
        self.state = ConnectionState::Attached;
        self.last_ping = Some(now);
        self.missed = 0;
        Ok(())
    }

    /// Record a pong. Any pong proves the peer is alive, so the missed
    /// counter resets regardless of which ping it answers.
    pub fn pong_received(&mut self) {
        self.missed = 0;
    }

    /// Mark connection as closed.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Timeout that has expired at `now`, if any.
    pub fn check_timeout(&self, now: I) -> Option<ConnectionError> {
        match self.state {
            ConnectionState::AwaitingHello => {
                let elapsed = now - self.opened_at;
                (elapsed > self.config.hello_timeout)
                    .then_some(ConnectionError::HelloTimeout { elapsed })
            },
            ConnectionState::Attached if self.heartbeat_due(now) => (self.missed
                >= self.config.max_missed_pongs)
                .then_some(ConnectionError::PongTimeout { missed: self.missed }),
            _ => None,
        }
    }

    fn heartbeat_due(&self, now: I) -> bool {
        self.last_ping.is_none_or(|last| now - last >= self.config.heartbeat_interval)
    }

    /// Process periodic maintenance (timeouts and heartbeats).
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        if let Some(err) = self.check_timeout(now) {
            let code = match err {
                ConnectionError::HelloTimeout { .. } => CloseCode::Unacceptable,
                _ => CloseCode::GoingAway,
            };
            self.close();
            return vec![ConnectionAction::Close { code, reason: err.to_string() }];
        }

        if self.state == ConnectionState::Attached && self.heartbeat_due(now) {
            self.last_ping = Some(now);
            self.missed += 1;
            return vec![ConnectionAction::SendPing];
        }

        Vec::new()
    }
}
