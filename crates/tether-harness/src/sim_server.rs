//! Simulation server wrapper.
//!
//! `SimServer` wraps `ServerDriver` with in-memory channels and a virtual
//! timer queue. Tests explicitly drive it: open channels, push lines, tick,
//! and advance the clock. Nothing runs on its own.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use tether_core::{Channel, MemoryChannel, SessionId, SessionTask, SharedStore, env::Environment};
use tether_proto::{CloseCode, Command};
use tether_server::{DriverConfig, LogLevel, ServerAction, ServerDriver, ServerEvent};

use crate::{
    remote::RemotePeer,
    sim_env::{SimEnv, SimInstant},
};

/// Upper bound on host/remote exchange rounds before giving up.
const MAX_EXCHANGE_ROUNDS: usize = 64;

/// Channel state for a simulated channel.
///
/// Commands go through the real line encoding, so whatever the test reads
/// back has survived an encode/decode trip.
#[derive(Debug, Default)]
struct SimChannel {
    wire: MemoryChannel,
    /// Lines already handed to the test
    taken: usize,
}

/// Simulation server for deterministic tests.
pub struct SimServer {
    /// The action-based server driver
    driver: ServerDriver<SimEnv>,
    env: SimEnv,
    /// Channel state (`channel_id` -> state)
    channels: HashMap<u64, SimChannel>,
    /// Pending timers keyed by (due, sequence)
    timers: BTreeMap<(SimInstant, u64), (SessionId, SessionTask)>,
    next_channel_id: u64,
    next_timer: u64,
    logs: Vec<(LogLevel, String)>,
    errors: Vec<String>,
}

impl SimServer {
    /// Create a simulation server with a fresh `SimEnv`.
    pub fn new(store: SharedStore, config: DriverConfig) -> Self {
        Self::with_env(SimEnv::new(), store, config)
    }

    /// Create a simulation server sharing `env` with the test.
    pub fn with_env(env: SimEnv, store: SharedStore, config: DriverConfig) -> Self {
        Self {
            driver: ServerDriver::new(env.clone(), store, config),
            env,
            channels: HashMap::new(),
            timers: BTreeMap::new(),
            next_channel_id: 1,
            next_timer: 0,
            logs: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &ServerDriver<SimEnv> {
        &self.driver
    }

    /// Mutable driver, for registering apps or touching sessions directly.
    /// Call [`SimServer::flush`] afterwards to collect what they produced.
    pub fn driver_mut(&mut self) -> &mut ServerDriver<SimEnv> {
        &mut self.driver
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Open a channel and return its id.
    pub fn connect(&mut self) -> u64 {
        let channel_id = self.next_channel_id;
        self.next_channel_id += 1;
        self.channels.insert(channel_id, SimChannel::default());
        self.process(ServerEvent::ChannelOpened { channel_id });
        channel_id
    }

    /// Deliver a command from the remote on `channel_id`.
    pub fn send(&mut self, channel_id: u64, command: &Command) {
        self.send_line(channel_id, &command.encode());
    }

    /// Deliver a raw line from the remote on `channel_id`.
    pub fn send_line(&mut self, channel_id: u64, line: &str) {
        self.process(ServerEvent::LineReceived { channel_id, line: line.to_string() });
    }

    /// The remote dropped the channel.
    pub fn disconnect(&mut self, channel_id: u64, reason: &str) {
        self.process(ServerEvent::ChannelClosed { channel_id, reason: reason.to_string() });
    }

    /// Run one driver tick at the current virtual time.
    pub fn tick(&mut self) {
        self.process(ServerEvent::Tick);
    }

    /// Collect actions produced outside an event (after `driver_mut`).
    pub fn flush(&mut self) {
        let actions = self.driver.drain();
        self.execute(actions);
    }

    /// Advance the clock by `duration`, firing timers in due order.
    pub fn advance(&mut self, duration: Duration) {
        let deadline = self.env.now() + duration;
        while let Some(due) = self.next_due().filter(|due| *due <= deadline) {
            self.env.advance(due - self.env.now());
            self.fire_due();
        }
        self.env.advance(deadline - self.env.now());
    }

    /// Fire timers until none remain, advancing the clock as needed.
    pub fn settle(&mut self) {
        while let Some(due) = self.next_due() {
            self.env.advance(due - self.env.now());
            self.fire_due();
        }
    }

    /// Pump commands between the host channel and `peer` until both sides
    /// go quiet. Returns the number of host commands delivered.
    pub fn exchange(&mut self, channel_id: u64, peer: &mut RemotePeer) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_EXCHANGE_ROUNDS {
            self.settle();
            let outbound = self.take_outbox(channel_id);
            if outbound.is_empty() {
                return delivered;
            }
            delivered += outbound.len();
            for reply in peer.apply_all(&outbound) {
                self.send(channel_id, &reply);
            }
        }
        tracing::warn!(channel_id, "exchange did not settle after {MAX_EXCHANGE_ROUNDS} rounds");
        delivered
    }

    /// Take everything written to `channel_id` so far.
    pub fn take_outbox(&mut self, channel_id: u64) -> Vec<Command> {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return Vec::new();
        };
        let lines = &channel.wire.lines()[channel.taken..];
        channel.taken += lines.len();
        lines.iter().filter_map(|line| Command::decode(line).ok()).collect()
    }

    /// Close code and reason if the server closed `channel_id`.
    pub fn close_reason(&self, channel_id: u64) -> Option<&(CloseCode, String)> {
        self.channels.get(&channel_id)?.wire.close_reason()
    }

    /// Whether `channel_id` is open on both ends.
    pub fn is_open(&self, channel_id: u64) -> bool {
        self.channels.get(&channel_id).is_some_and(|channel| !channel.wire.is_closed())
    }

    /// Session bound to `channel_id`.
    pub fn session_id(&self, channel_id: u64) -> Option<SessionId> {
        self.driver.session_for(channel_id).map(|session| session.id().clone())
    }

    /// Log actions seen so far.
    pub fn logs(&self) -> &[(LogLevel, String)] {
        &self.logs
    }

    /// Driver errors seen so far.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Timers not yet fired.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn next_due(&self) -> Option<SimInstant> {
        self.timers.keys().next().map(|(due, _)| *due)
    }

    fn fire_due(&mut self) {
        let now = self.env.now();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let (session_id, task) = entry.remove();
            self.process(ServerEvent::TaskDue { session_id, task });
        }
    }

    fn process(&mut self, event: ServerEvent) {
        match self.driver.process_event(event) {
            Ok(actions) => self.execute(actions),
            Err(e) => {
                tracing::debug!("SimServer driver error: {}", e);
                self.errors.push(e.to_string());
            },
        }
    }

    fn execute(&mut self, actions: Vec<ServerAction<SimInstant>>) {
        for action in actions {
            match action {
                ServerAction::Send { channel_id, command } => {
                    let sent = self.channels.get_mut(&channel_id).map(|channel| channel.wire.send_command(&command));
                    if !matches!(sent, Some(Ok(()))) {
                        tracing::debug!(channel_id, "SimServer: send to closed channel dropped");
                    }
                },
                ServerAction::CloseChannel { channel_id, code, reason } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        let notice = Command::Close { code: code.to_u16(), reason: reason.clone() };
                        if channel.wire.send_command(&notice).is_ok() {
                            channel.wire.close(code, &reason);
                        }
                    }
                },
                ServerAction::Schedule { delay, session_id, task } => {
                    let due = self.env.now() + delay;
                    self.timers.insert((due, self.next_timer), (session_id, task));
                    self.next_timer += 1;
                },
                ServerAction::Log { level, message, .. } => {
                    tracing::debug!(?level, "{}", message);
                    self.logs.push((level, message));
                },
            }
        }
    }
}

impl std::fmt::Debug for SimServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimServer")
            .field("env", &self.env)
            .field("channels", &self.channels.len())
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}
