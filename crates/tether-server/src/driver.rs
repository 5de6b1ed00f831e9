//! Server driver.
//!
//! Ties together channel liveness state machines, the session manager, and
//! line decoding. The driver performs no I/O: the runtime feeds it
//! [`ServerEvent`]s and executes the [`ServerAction`]s it returns.
//!
//! # Channel handshake
//!
//! ```text
//! ChannelOpened ──> AwaitingHello ──HELLO app [id]──> Attached ──> ChannelClosed
//!                        │                              │
//!                        └─ other command / timeout ────┴─> CloseChannel
//! ```
//!
//! `HELLO` with a session id attaches to that pending session; without one a
//! fresh session is created and attached on the spot.

use std::{collections::HashMap, time::Duration};

use tether_core::{
    Connection, ConnectionAction, ConnectionConfig, ConnectionState, RuntimeLauncher, Session, SessionAction,
    SessionConfig, SessionId, SessionTask, env::Environment,
};
use tether_proto::{CloseCode, Command};

use crate::{
    manager::{Application, ManagerConfig, ManagerError, SessionManager},
    server_error::ServerError,
};

/// Default cap on simultaneously open channels.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connection configuration (hello timeout, heartbeat)
    pub connection: ConnectionConfig,
    /// Session manager configuration (pending reaping)
    pub manager: ManagerConfig,
    /// Configuration handed to every new session
    pub session: SessionConfig,
    /// Maximum concurrent channels
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            manager: ManagerConfig::default(),
            session: SessionConfig::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Events that the server driver processes.
///
/// These are produced by the external runtime (simulation or production).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new channel was accepted
    ChannelOpened {
        /// Unique channel ID assigned by the runtime
        channel_id: u64,
    },

    /// One line arrived on a channel (without its trailing newline)
    LineReceived {
        /// Channel that sent the line
        channel_id: u64,
        /// Raw line
        line: String,
    },

    /// A channel was closed (by peer or error)
    ChannelClosed {
        /// Channel that was closed
        channel_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Periodic tick for heartbeats and timeouts
    Tick,

    /// A task from [`ServerAction::Schedule`] is due
    TaskDue {
        /// Session that scheduled it
        session_id: SessionId,
        /// Task to run
        task: SessionTask,
    },
}

/// Actions that the server driver produces.
///
/// These are executed by runtime-specific code (production or simulation).
#[derive(Debug, Clone, PartialEq)]
pub enum ServerAction<I = std::time::Instant> {
    /// Write a command to a channel
    Send {
        /// Target channel
        channel_id: u64,
        /// Command to write
        command: Command,
    },

    /// Send `CLOSE` and shut the channel down
    CloseChannel {
        /// Channel to close
        channel_id: u64,
        /// Close code
        code: CloseCode,
        /// Human-readable reason
        reason: String,
    },

    /// Post [`ServerEvent::TaskDue`] after `delay`
    Schedule {
        /// Delay before the task is due
        delay: Duration,
        /// Owning session
        session_id: SessionId,
        /// Task to hand back
        task: SessionTask,
    },

    /// Log a message (for debugging/monitoring)
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
        /// When the event occurred
        timestamp: I,
    },
}

/// Log levels for server actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

#[derive(Debug)]
struct ChannelState<I>
where
    I: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>,
{
    connection: Connection<I>,
    session: Option<SessionId>,
}

/// Action-based server driver.
///
/// Orchestrates channel liveness, the handshake, and routing between
/// channels and sessions.
pub struct ServerDriver<E>
where
    E: Environment,
{
    /// Channel state machines (channel_id -> state)
    channels: HashMap<u64, ChannelState<E::Instant>>,
    /// Attached session -> channel
    bound: HashMap<SessionId, u64>,
    manager: SessionManager<E::Instant>,
    env: E,
    config: ServerConfig,
}

impl<E> ServerDriver<E>
where
    E: Environment,
{
    /// Create a new server driver whose sessions deliver from `store`.
    pub fn new(env: E, store: tether_core::SharedStore, config: ServerConfig) -> Self {
        let manager = SessionManager::new(store, config.manager.clone(), config.session.clone());
        Self { channels: HashMap::new(), bound: HashMap::new(), manager, env, config }
    }

    /// Register an application with the session manager.
    pub fn register_app(&mut self, name: &str, app: impl Application + 'static) -> Result<(), ManagerError> {
        self.manager.register_app(name, app)
    }

    /// Create a pending session ahead of its channel, e.g. before launching
    /// a remote runtime that will `HELLO` with the returned id.
    pub fn create_session(&mut self, app: &str) -> Result<SessionId, ManagerError> {
        self.manager.create_session(app, &self.env)
    }

    /// Create a pending session and start a remote runtime for it.
    ///
    /// The runtime is pointed at `{base_url}/{app}/?session_id={id}` and is
    /// expected to `HELLO` with that id. If it cannot be started the session
    /// is closed again. The runtime is terminated when the session closes.
    pub fn launch(
        &mut self,
        app: &str,
        launcher: &dyn RuntimeLauncher,
        base_url: &str,
    ) -> Result<SessionId, ServerError> {
        let session_id = self.manager.create_session(app, &self.env)?;
        let url = format!("{}/{app}/?session_id={session_id}", base_url.trim_end_matches('/'));

        let handle = match launcher.launch(&url, &session_id) {
            Ok(handle) => handle,
            Err(err) => {
                self.manager.close_session(&session_id);
                return Err(ServerError::Launch(err));
            },
        };
        if let Some(session) = self.manager.session_mut(&session_id) {
            session.set_runtime(handle).map_err(ManagerError::from)?;
        }
        tracing::info!(session_id = %session_id, app, %url, "runtime launched");
        Ok(session_id)
    }

    /// Session manager
    pub fn manager(&self) -> &SessionManager<E::Instant> {
        &self.manager
    }

    /// Mutable session manager.
    ///
    /// Commands a caller produces through it are picked up by the next
    /// [`ServerDriver::process_event`] or [`ServerDriver::drain`].
    pub fn manager_mut(&mut self) -> &mut SessionManager<E::Instant> {
        &mut self.manager
    }

    /// Environment
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channel bound to `session`.
    pub fn channel_for(&self, session: &SessionId) -> Option<u64> {
        self.bound.get(session).copied()
    }

    /// Process a server event and return actions to execute.
    ///
    /// This is the main entry point for the server driver.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction<E::Instant>>, ServerError> {
        let mut actions = match event {
            ServerEvent::ChannelOpened { channel_id } => self.handle_channel_opened(channel_id)?,
            ServerEvent::LineReceived { channel_id, line } => self.handle_line(channel_id, &line)?,
            ServerEvent::ChannelClosed { channel_id, reason } => self.handle_channel_closed(channel_id, &reason),
            ServerEvent::Tick => self.handle_tick(),
            ServerEvent::TaskDue { session_id, task } => self.handle_task(&session_id, task),
        };
        actions.extend(self.drain());
        Ok(actions)
    }

    /// Collect the outstanding actions of every session.
    ///
    /// Sessions closed from application code (`Session::close` or
    /// `SessionManager::close_session`) lose their channel here, the same
    /// way a dropped channel loses its session.
    pub fn drain(&mut self) -> Vec<ServerAction<E::Instant>> {
        let mut actions = self.sweep_closed_sessions();
        let drained: Vec<(SessionId, Vec<SessionAction>)> = self
            .manager
            .sessions_mut()
            .map(|(id, session)| (id.clone(), session.take_actions()))
            .filter(|(_, actions)| !actions.is_empty())
            .collect();

        for (session_id, session_actions) in drained {
            let channel = self.bound.get(&session_id).copied();
            for action in session_actions {
                match action {
                    SessionAction::Send(command) => match channel {
                        Some(channel_id) => actions.push(ServerAction::Send { channel_id, command }),
                        None => actions.push(self.log(
                            LogLevel::Debug,
                            format!("session {session_id} has no channel, dropping {}", command.verb_str()),
                        )),
                    },
                    SessionAction::Schedule { delay, task } => {
                        actions.push(ServerAction::Schedule { delay, session_id: session_id.clone(), task });
                    },
                }
            }
        }
        actions
    }

    fn sweep_closed_sessions(&mut self) -> Vec<ServerAction<E::Instant>> {
        for session_id in self.manager.sweep_closed() {
            tracing::debug!(session_id = %session_id, "closed session swept");
        }
        let orphaned: Vec<(SessionId, u64)> = self
            .bound
            .iter()
            .filter(|(session_id, _)| self.manager.session(session_id).is_none())
            .map(|(session_id, channel_id)| (session_id.clone(), *channel_id))
            .collect();

        let mut actions = Vec::new();
        for (session_id, channel_id) in orphaned {
            self.bound.remove(&session_id);
            if let Some(mut state) = self.channels.remove(&channel_id) {
                state.connection.close();
            }
            actions.push(ServerAction::CloseChannel {
                channel_id,
                code: CloseCode::Normal,
                reason: "session closed".to_string(),
            });
            actions.push(self.log(LogLevel::Info, format!("session {session_id} closed, closing channel {channel_id}")));
        }
        actions
    }

    fn handle_channel_opened(&mut self, channel_id: u64) -> Result<Vec<ServerAction<E::Instant>>, ServerError> {
        if self.channels.contains_key(&channel_id) {
            return Err(ServerError::ChannelAlreadyExists(channel_id));
        }
        if self.channels.len() >= self.config.max_connections {
            return Ok(vec![
                ServerAction::CloseChannel {
                    channel_id,
                    code: CloseCode::GoingAway,
                    reason: "max connections exceeded".to_string(),
                },
                self.log(LogLevel::Warn, format!("channel {channel_id} refused: max connections exceeded")),
            ]);
        }

        let connection = Connection::new(self.env.now(), self.config.connection.clone());
        self.channels.insert(channel_id, ChannelState { connection, session: None });
        Ok(vec![self.log(LogLevel::Debug, format!("channel {channel_id} opened"))])
    }

    fn handle_line(&mut self, channel_id: u64, line: &str) -> Result<Vec<ServerAction<E::Instant>>, ServerError> {
        let state = self.channels.get_mut(&channel_id).ok_or(ServerError::ChannelNotFound(channel_id))?;
        let decoded = Command::decode(line);

        let Some(session_id) = state.session.clone() else {
            return Ok(match decoded {
                Ok(Command::Hello { app, session_id }) => self.handle_hello(channel_id, &app, session_id),
                Ok(other) => self.close_channel(
                    channel_id,
                    CloseCode::ProtocolError,
                    format!("expected HELLO, got {}", other.verb_str()),
                ),
                Err(err) => self.close_channel(
                    channel_id,
                    CloseCode::ProtocolError,
                    format!("expected HELLO: {}", ServerError::from(err)),
                ),
            });
        };

        let command = match decoded {
            Ok(command) => command,
            Err(err) => {
                return Ok(vec![
                    self.log(LogLevel::Warn, format!("malformed line from session {session_id} dropped: {err}")),
                ]);
            },
        };

        match command {
            Command::Hello { .. } => {
                return Ok(vec![
                    self.log(LogLevel::Warn, format!("session {session_id} sent HELLO twice, ignored")),
                ]);
            },
            Command::Pong { .. } => state.connection.pong_received(),
            _ => {},
        }

        match self.manager.session_mut(&session_id) {
            Some(session) => {
                session.receive(command);
                Ok(Vec::new())
            },
            None => Ok(self.close_channel(channel_id, CloseCode::GoingAway, "session is gone".to_string())),
        }
    }

    fn handle_hello(
        &mut self,
        channel_id: u64,
        app: &str,
        requested: Option<String>,
    ) -> Vec<ServerAction<E::Instant>> {
        let Some(app) = self.manager.has_app_name(app).map(str::to_string) else {
            return self.close_channel(
                channel_id,
                CloseCode::Unacceptable,
                "could not associate channel with an app".to_string(),
            );
        };

        let (session_id, fresh) = match requested {
            Some(id) => (SessionId::from(id.as_str()), false),
            None => match self.manager.create_session(&app, &self.env) {
                Ok(id) => (id, true),
                Err(err) => {
                    return self.close_channel(
                        channel_id,
                        CloseCode::Unacceptable,
                        format!("could not attach session: {err}"),
                    );
                },
            },
        };

        if let Err(err) = self.manager.attach(&app, &session_id) {
            if fresh {
                self.manager.close_session(&session_id);
            }
            return self.close_channel(channel_id, CloseCode::Unacceptable, format!("could not attach session: {err}"));
        }

        let now = self.env.now();
        if let Some(state) = self.channels.get_mut(&channel_id) {
            // Still awaiting HELLO here, so this cannot fail
            let _ = state.connection.attach(now);
            state.session = Some(session_id.clone());
        }
        self.bound.insert(session_id.clone(), channel_id);

        vec![self.log(LogLevel::Info, format!("channel {channel_id} attached to {app} session {session_id}"))]
    }

    fn handle_channel_closed(&mut self, channel_id: u64, reason: &str) -> Vec<ServerAction<E::Instant>> {
        let Some(mut state) = self.channels.remove(&channel_id) else {
            return Vec::new();
        };
        state.connection.close();

        let mut actions = Vec::new();
        if let Some(session_id) = state.session {
            self.bound.remove(&session_id);
            self.manager.close_session(&session_id);
            actions.push(
                self.log(LogLevel::Info, format!("channel {channel_id} closed: {reason}, session {session_id} closed")),
            );
        } else {
            actions.push(self.log(LogLevel::Debug, format!("channel {channel_id} closed before HELLO: {reason}")));
        }
        actions
    }

    fn handle_tick(&mut self) -> Vec<ServerAction<E::Instant>> {
        let now = self.env.now();
        let mut actions = Vec::new();

        let channel_ids: Vec<u64> = self.channels.keys().copied().collect();
        for channel_id in channel_ids {
            let Some(state) = self.channels.get_mut(&channel_id) else { continue };
            let session_id = state.session.clone();

            for action in state.connection.tick(now) {
                match action {
                    ConnectionAction::SendPing => {
                        if let Some(session) = session_id.as_ref().and_then(|id| self.manager.session_mut(id)) {
                            session.ping();
                        }
                    },
                    ConnectionAction::Close { code, reason } => {
                        actions.extend(self.close_channel(channel_id, code, reason));
                    },
                }
            }
        }

        for session_id in self.manager.reap_pending(now) {
            actions.push(self.log(LogLevel::Info, format!("session {session_id} reaped: never attached")));
        }
        actions
    }

    fn handle_task(&mut self, session_id: &SessionId, task: SessionTask) -> Vec<ServerAction<E::Instant>> {
        match self.manager.session_mut(session_id) {
            Some(session) => {
                session.run_task(task);
                Vec::new()
            },
            None => vec![self.log(LogLevel::Debug, format!("task for closed session {session_id} dropped"))],
        }
    }

    /// Forget a channel, close its session, and tell the runtime to shut it.
    fn close_channel(&mut self, channel_id: u64, code: CloseCode, reason: String) -> Vec<ServerAction<E::Instant>> {
        if let Some(mut state) = self.channels.remove(&channel_id) {
            state.connection.close();
            if let Some(session_id) = state.session {
                self.bound.remove(&session_id);
                self.manager.close_session(&session_id);
            }
        }

        let log = self.log(LogLevel::Info, format!("closing channel {channel_id} ({}): {reason}", code.to_u16()));
        vec![ServerAction::CloseChannel { channel_id, code, reason }, log]
    }

    fn log(&self, level: LogLevel, message: String) -> ServerAction<E::Instant> {
        ServerAction::Log { level, message, timestamp: self.env.now() }
    }
}

impl<E: Environment> std::fmt::Debug for ServerDriver<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDriver")
            .field("channels", &self.channels.len())
            .field("manager", &self.manager)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: Environment> ServerDriver<E> {
    /// Liveness state of a channel.
    pub fn channel_state(&self, channel_id: u64) -> Option<ConnectionState> {
        self.channels.get(&channel_id).map(|state| state.connection.state())
    }

    /// Session behind a channel.
    pub fn session_for(&self, channel_id: u64) -> Option<&Session> {
        let id = self.channels.get(&channel_id)?.session.as_ref()?;
        self.manager.session(id)
    }
}
