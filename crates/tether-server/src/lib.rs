//! Tether production server.
//!
//! Production server implementation using tokio TCP for transport, system
//! time, and OS randomness.
//!
//! # Architecture
//!
//! This crate wraps [`tether_core`]'s action-based logic with real I/O. The
//! [`ServerDriver`] follows the Sans-IO pattern, while [`Server`] executes its
//! actions against sockets and timers.
//!
//! Sessions and mirrors are single-threaded, so the driver lives on the task
//! that calls [`Server::run`]. Per-channel reader tasks hand lines to it over
//! an unbounded mpsc queue; that queue is the only thread-safe boundary.
//!
//! # Components
//!
//! - [`SessionManager`]: applications, pending and connected sessions
//! - [`ServerDriver`]: action-based orchestrator (pure logic, no I/O)
//! - [`Server`]: production runtime that executes `ServerDriver` actions
//! - [`TcpTransport`]: newline-delimited commands over TCP
//! - [`SystemEnv`]: production environment (real time, crypto RNG)
//! - [`MonitorApp`]: built-in application showing live connection counts

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
mod fetcher;
mod manager;
mod monitor;
mod server_error;
mod system_env;
mod transport;

use std::{collections::HashMap, path::PathBuf, time::Duration};

pub use driver::{
    DEFAULT_MAX_CONNECTIONS, LogLevel, ServerAction, ServerConfig as DriverConfig, ServerDriver, ServerEvent,
};
pub use error::ServerError;
pub use fetcher::DirectoryFetcher;
pub use manager::{
    Application, ConnectionsChanged, DEFAULT_APP_NAME, DEFAULT_PENDING_TIMEOUT, DEFAULT_REAP_INTERVAL,
    ManagerConfig, ManagerError, SessionManager, valid_app_name,
};
pub use monitor::{MONITOR, MONITOR_APP_NAME, MonitorApp};
pub use server_error::ServerError as DriverError;
pub use system_env::SystemEnv;
use tether_core::{AssetStore, Channel, env::Environment};
use tokio::{sync::mpsc, time::MissedTickBehavior};
pub use transport::{TcpChannel, TcpTransport, spawn_channel};

/// Default interval between driver ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "127.0.0.1:7070")
    pub bind_address: String,
    /// How often heartbeats and timeouts are checked
    pub tick_interval: Duration,
    /// Directory that remote asset references resolve against
    pub asset_dir: Option<PathBuf>,
    /// Driver configuration (timeouts, limits)
    pub driver: DriverConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7070".to_string(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            asset_dir: None,
            driver: DriverConfig::default(),
        }
    }
}

/// Production Tether server.
///
/// Wraps `ServerDriver` with the TCP transport and system environment.
pub struct Server {
    /// The action-based server driver
    driver: ServerDriver<SystemEnv>,
    /// TCP listener
    transport: TcpTransport,
    /// Environment
    env: SystemEnv,
    tick_interval: Duration,
    /// Write side of every open channel
    channels: HashMap<u64, TcpChannel>,
    next_channel_id: u64,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Server {
    /// Create and bind a new server.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let store = match &config.asset_dir {
            Some(dir) if !dir.is_dir() => {
                return Err(ServerError::Config(format!("asset directory {} does not exist", dir.display())));
            },
            Some(dir) => AssetStore::new().with_fetcher(DirectoryFetcher::new(dir)),
            None => AssetStore::new(),
        };

        let env = SystemEnv::new();
        let driver = ServerDriver::new(env.clone(), store.into_shared(), config.driver);
        let transport = TcpTransport::bind(&config.bind_address).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            driver,
            transport,
            env,
            tick_interval: config.tick_interval,
            channels: HashMap::new(),
            next_channel_id: 1,
            events_tx,
            events_rx,
        })
    }

    /// The driver, for registering applications before [`Server::run`].
    pub fn driver_mut(&mut self) -> &mut ServerDriver<SystemEnv> {
        &mut self.driver
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Run the server, accepting channels and processing commands.
    ///
    /// Returns after Ctrl-C; every open channel is closed with 1001 first.
    pub async fn run(mut self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let channel_id = self.next_channel_id;
                        self.next_channel_id += 1;
                        tracing::debug!(channel_id, %peer, "accepted");

                        let channel = spawn_channel(channel_id, stream, self.events_tx.clone());
                        self.channels.insert(channel_id, channel);
                        self.dispatch(ServerEvent::ChannelOpened { channel_id });
                    },
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
                Some(event) = self.events_rx.recv() => self.dispatch(event),
                _ = ticker.tick() => self.dispatch(ServerEvent::Tick),
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        tracing::info!(channels = self.channels.len(), "Server shutting down");
        for (_, mut channel) in self.channels.drain() {
            channel.close(tether_proto::CloseCode::GoingAway, "server shutting down");
        }
        Ok(())
    }

    fn dispatch(&mut self, event: ServerEvent) {
        if let ServerEvent::ChannelClosed { channel_id, .. } = &event {
            self.channels.remove(channel_id);
        }

        match self.driver.process_event(event) {
            Ok(actions) => self.execute(actions),
            Err(e) if e.is_transient() => tracing::debug!("Driver error: {}", e),
            Err(e) => tracing::warn!("Driver error: {}", e),
        }
    }

    fn execute(&mut self, actions: Vec<ServerAction>) {
        for action in actions {
            match action {
                ServerAction::Send { channel_id, command } => match self.channels.get_mut(&channel_id) {
                    Some(channel) => {
                        if let Err(e) = channel.send_command(&command) {
                            tracing::debug!(channel_id, error = %e, "send failed");
                        }
                    },
                    None => tracing::debug!(channel_id, "send to unknown channel dropped"),
                },
                ServerAction::CloseChannel { channel_id, code, reason } => {
                    if let Some(mut channel) = self.channels.remove(&channel_id) {
                        channel.close(code, &reason);
                    }
                },
                ServerAction::Schedule { delay, session_id, task } => {
                    let events = self.events_tx.clone();
                    let env = self.env.clone();
                    tokio::spawn(async move {
                        env.sleep(delay).await;
                        let _ = events.send(ServerEvent::TaskDue { session_id, task });
                    });
                },
                ServerAction::Log { level, message, .. } => match level {
                    LogLevel::Debug => tracing::debug!("{}", message),
                    LogLevel::Info => tracing::info!("{}", message),
                    LogLevel::Warn => tracing::warn!("{}", message),
                    LogLevel::Error => tracing::error!("{}", message),
                },
            }
        }
    }
}
