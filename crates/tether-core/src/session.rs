//! One host/remote session: identity, status, command queue, mirror registry.
//!
//! The session is a Sans-IO state machine. Outbound traffic and timers leave
//! it as [`SessionAction`]s which the driver drains with
//! [`Session::take_actions`]; inbound commands enter through
//! [`Session::receive`].
//!
//! # Status
//!
//! ```text
//! ┌─────────┐ attach ┌───────────┐ close / channel drop ┌────────┐
//! │ Pending │───────>│ Connected │─────────────────────>│ Closed │
//! └─────────┘        └───────────┘                      └────────┘
//!      │                  close                              ↑
//!      └─────────────────────────────────────────────────────┘
//! ```
//!
//! While pending, outbound commands queue in order and are never dropped.
//! Attaching flushes the queue and then sends `INIT-DONE`. Once closed,
//! sends are logged and ignored.

use std::{
    borrow::Borrow,
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fmt,
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde_json::{Map, Value};
use tether_proto::{Command, DefineKind, DiagnosticLevel};

use crate::{
    asset::{AssetKind, validate_name},
    env::Environment,
    error::SessionError,
    keepalive::KeepAlive,
    mirror::{Inbound, Mirror, MirrorClass, WeakMirror},
    resolver::Dependent,
    store::SharedStore,
};

/// Length of generated session ids.
pub const SESSION_ID_LEN: usize = 24;

/// Default window over which inbound property sets and events coalesce.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(10);

const ID_ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Opaque session token.
///
/// Generated ids are 24 characters over a 62-symbol alphabet, just over 142
/// bits of entropy. Collisions are not re-checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random id.
    pub fn generate<E: Environment>(env: &E) -> Self {
        let mut out = String::with_capacity(SESSION_ID_LEN);
        let mut buf = [0u8; 32];
        while out.len() < SESSION_ID_LEN {
            env.random_bytes(&mut buf);
            // 248 = 4 * 62; rejecting the tail keeps symbols uniform
            for &b in buf.iter().filter(|&&b| b < 248) {
                if out.len() == SESSION_ID_LEN {
                    break;
                }
                out.push(char::from(ID_ALPHABET[usize::from(b % 62)]));
            }
        }
        Self(out)
    }

    /// Id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Created, no peer yet; commands queue
    Pending,
    /// Peer attached; commands go straight out
    Connected,
    /// Terminal
    Closed,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay between the first inbound item of a burst and its flush
    pub batch_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { batch_window: DEFAULT_BATCH_WINDOW }
    }
}

/// Deferred work the driver hands back through [`Session::run_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTask {
    /// Deliver a mirror's batched events
    Flush {
        /// Mirror id
        id: String,
    },
}

/// Actions produced by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Write a command to the channel
    Send(Command),

    /// Run `task` after `delay`
    Schedule {
        /// Delay before the task is due
        delay: Duration,
        /// Task to hand back
        task: SessionTask,
    },
}

/// Callback run once a heartbeat round trip completes.
pub type RoundtripCallback = Box<dyn FnOnce(&mut Session)>;

/// Callback receiving the value of an `EVALANDRETURN`.
pub type EvalCallback = Box<dyn FnOnce(&mut Session, Value)>;

/// Handle to a launched remote runtime.
pub trait RuntimeHandle {
    /// Ask the runtime to terminate.
    fn close(&mut self);
}

/// Launches a remote runtime for a session.
pub trait RuntimeLauncher {
    /// Start a runtime pointed at `url` for session `id`.
    fn launch(&self, url: &str, id: &SessionId) -> std::io::Result<Box<dyn RuntimeHandle>>;
}

/// One host/remote session.
pub struct Session {
    id: SessionId,
    app_name: String,
    status: SessionStatus,
    config: SessionConfig,
    store: SharedStore,
    /// Outbound commands held while pending
    queue: VecDeque<Command>,
    actions: Vec<SessionAction>,
    registry: BTreeMap<String, WeakMirror>,
    /// Ids the host disposed that the remote has not acknowledged
    dead_ids: HashSet<String>,
    /// Ids chosen by the remote; the host counter skips them
    remote_ids: HashSet<String>,
    next_id: u64,
    present_modules: HashSet<String>,
    present_classes: HashSet<String>,
    delivered_assets: HashSet<String>,
    ignored_assets: HashSet<String>,
    data_names: HashSet<String>,
    guards: KeepAlive<Mirror>,
    ping_counter: u64,
    /// (due ping count, callback)
    roundtrips: Vec<(u64, RoundtripCallback)>,
    evals: HashMap<u64, EvalCallback>,
    next_eval: u64,
    root: Option<Mirror>,
    runtime: Option<Box<dyn RuntimeHandle>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("app_name", &self.app_name)
            .field("status", &self.status)
            .field("queued", &self.queue.len())
            .field("mirrors", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// New pending session.
    pub fn new(id: SessionId, app_name: impl Into<String>, store: SharedStore, config: SessionConfig) -> Self {
        Self {
            id,
            app_name: app_name.into(),
            status: SessionStatus::Pending,
            config,
            store,
            queue: VecDeque::new(),
            actions: Vec::new(),
            registry: BTreeMap::new(),
            dead_ids: HashSet::new(),
            remote_ids: HashSet::new(),
            next_id: 0,
            present_modules: HashSet::new(),
            present_classes: HashSet::new(),
            delivered_assets: HashSet::new(),
            ignored_assets: HashSet::new(),
            data_names: HashSet::new(),
            guards: KeepAlive::new(),
            ping_counter: 0,
            roundtrips: Vec::new(),
            evals: HashMap::new(),
            next_eval: 0,
            root: None,
            runtime: None,
        }
    }

    /// Session id
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Application this session serves
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Asset store this session delivers from.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Commands waiting for a peer.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Drain the actions produced since the last call.
    pub fn take_actions(&mut self) -> Vec<SessionAction> {
        std::mem::take(&mut self.actions)
    }

    /// Send a command, honoring the queue discipline of the current status.
    pub fn send(&mut self, command: Command) {
        match self.status {
            SessionStatus::Pending => self.queue.push_back(command),
            SessionStatus::Connected => self.actions.push(SessionAction::Send(command)),
            SessionStatus::Closed => {
                tracing::warn!(session_id = %self.id, verb = command.verb_str(), "send on closed session ignored");
            },
        }
    }

    /// Evaluate `code` remotely.
    pub fn exec(&mut self, code: impl Into<String>) {
        self.send(Command::exec(code));
    }

    /// Evaluate `code` remotely and hand the result to `callback`. Returns
    /// the eval id the reply is matched by.
    pub fn eval(&mut self, code: impl Into<String>, callback: impl FnOnce(&mut Session, Value) + 'static) -> u64 {
        let eval_id = self.next_eval;
        self.next_eval += 1;
        if self.status != SessionStatus::Closed {
            self.evals.insert(eval_id, Box::new(callback));
        }
        self.send(Command::EvalAndReturn { code: code.into(), eval_id });
        eval_id
    }

    /// Evaluations still waiting for their result.
    pub fn pending_evals(&self) -> usize {
        self.evals.len()
    }

    pub(crate) fn schedule(&mut self, delay: Duration, task: SessionTask) {
        if self.status != SessionStatus::Closed {
            self.actions.push(SessionAction::Schedule { delay, task });
        }
    }

    /// Bind the peer: flush queued commands in order, then `INIT-DONE`.
    ///
    /// # Errors
    ///
    /// - `SessionError::AlreadyAttached` if a peer already attached
    /// - `SessionError::InvalidState` if the session is closed
    pub fn attach(&mut self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Pending => {},
            SessionStatus::Connected => return Err(SessionError::AlreadyAttached(self.id.to_string())),
            SessionStatus::Closed => {
                return Err(SessionError::InvalidState { status: self.status, operation: "attach" });
            },
        }

        self.status = SessionStatus::Connected;
        let flushed = self.queue.len();
        let queued: Vec<Command> = self.queue.drain(..).collect();
        self.actions.extend(queued.into_iter().map(SessionAction::Send));
        self.actions.push(SessionAction::Send(Command::InitDone));
        tracing::info!(session_id = %self.id, app = %self.app_name, flushed, "session attached");
        Ok(())
    }

    /// Close the session. Idempotent.
    ///
    /// Disposes every mirror, clears keep-alive guards (breaking reference
    /// cycles through the session), and terminates the runtime if one was
    /// launched.
    pub fn close(&mut self) {
        if self.status == SessionStatus::Closed {
            return;
        }
        self.status = SessionStatus::Closed;

        let mirrors: Vec<Mirror> = self.registry.values().filter_map(WeakMirror::upgrade).collect();
        for mirror in &mirrors {
            mirror.dispose_local();
        }
        self.registry.clear();
        self.dead_ids.clear();
        self.guards.clear();
        self.root = None;
        self.queue.clear();
        self.actions.clear();
        self.roundtrips.clear();
        self.evals.clear();

        if let Some(mut runtime) = self.runtime.take() {
            runtime.close();
        }
        tracing::info!(session_id = %self.id, app = %self.app_name, "session closed");
    }

    /// Attach the launched runtime.
    ///
    /// # Errors
    ///
    /// - `SessionError::RuntimeAlreadySet` if one is attached already
    pub fn set_runtime(&mut self, runtime: Box<dyn RuntimeHandle>) -> Result<(), SessionError> {
        if self.runtime.is_some() {
            return Err(SessionError::RuntimeAlreadySet);
        }
        self.runtime = Some(runtime);
        Ok(())
    }

    /// Root mirror of the application
    pub fn root(&self) -> Option<&Mirror> {
        self.root.as_ref()
    }

    /// Make `mirror` the root, keeping it alive for the session's lifetime.
    pub fn set_root(&mut self, mirror: Mirror) {
        self.root = Some(mirror);
    }

    /// Live mirror by id.
    pub fn mirror(&self, id: &str) -> Option<Mirror> {
        self.registry.get(id).and_then(WeakMirror::upgrade)
    }

    /// Live mirrors in id order.
    pub fn mirrors(&self) -> Vec<Mirror> {
        self.registry.values().filter_map(WeakMirror::upgrade).collect()
    }

    /// Number of registry entries (live or awaiting collection).
    pub fn mirror_count(&self) -> usize {
        self.registry.len()
    }

    /// Modules delivered to the remote.
    pub fn present_modules(&self) -> &HashSet<String> {
        &self.present_modules
    }

    /// Objects currently held by keep-alive guards.
    pub fn guarded_count(&self) -> usize {
        self.guards.len()
    }

    /// Heartbeat counter
    pub fn ping_counter(&self) -> u64 {
        self.ping_counter
    }

    pub(crate) fn allocate_id(&mut self, class_name: &str) -> String {
        loop {
            self.next_id += 1;
            let id = format!("{class_name}_{}", self.next_id);
            if !self.remote_ids.contains(&id) {
                return id;
            }
        }
    }

    pub(crate) fn register_mirror(&mut self, mirror: &Mirror) {
        self.registry.insert(mirror.id(), mirror.downgrade());
    }

    /// Drop the registry entry; `dead` keeps the id until `DISPOSE_ACK`.
    pub(crate) fn forget_mirror(&mut self, id: &str, dead: bool) {
        self.registry.remove(id);
        if dead {
            self.dead_ids.insert(id.to_string());
        }
    }

    /// Never deliver the named asset to this session.
    pub fn ignore_asset(&mut self, name: impl Into<String>) {
        self.ignored_assets.insert(name.into());
    }

    /// Make sure the remote can instantiate `class`.
    ///
    /// Collects the class' module and its transitive dependencies that are
    /// not yet present, orders them, and sends for each one its associated
    /// assets, its style and its code. A module that is already present but
    /// gained a class since delivery is sent again. Every command is built
    /// before the first is sent, so a failure delivers nothing.
    ///
    /// # Errors
    ///
    /// - `SessionError::Asset` on generator failure, cycles, or assets that
    ///   cannot be resolved
    pub fn register_class(&mut self, class: &'static MirrorClass) -> Result<(), SessionError> {
        if let Some(base) = class.base {
            self.register_class(base)?;
        }
        let qualified = class.qualified_name();
        if self.present_classes.contains(&qualified) {
            return Ok(());
        }

        let store = std::rc::Rc::clone(&self.store);
        let mut store = store.borrow_mut();
        let registration = store.register_class(class)?;
        let redefine = self.present_modules.contains(&registration.module);

        let needed: Vec<String> = store
            .dependency_closure(&[registration.module.as_str()])
            .into_iter()
            .filter(|m| !self.present_modules.contains(m) || (redefine && *m == registration.module))
            .collect();
        let names: Vec<&str> = needed.iter().map(String::as_str).collect();
        let order = store.resolve_modules(&names)?;

        for missing in &order.missing {
            if !self.present_modules.contains(&missing.dependency) {
                tracing::warn!(
                    session_id = %self.id,
                    module = %missing.item,
                    dependency = %missing.dependency,
                    "missing dependency"
                );
            }
        }

        let mut commands = Vec::new();
        let mut assets = Vec::new();
        for module in &order.modules {
            let module_name = module.name();
            for asset_name in store.associated_assets(module_name) {
                if self.delivered_assets.contains(asset_name)
                    || self.ignored_assets.contains(asset_name)
                    || assets.contains(asset_name)
                {
                    continue;
                }
                let Some(asset) = store.asset(asset_name) else { continue };
                let bytes = asset.resolve(store.fetcher())?;
                let source = match asset.kind() {
                    AssetKind::Binary => BASE64.encode(&bytes),
                    _ => String::from_utf8_lossy(&bytes).into_owned(),
                };
                commands.push(Command::define(asset.kind().define_kind(), asset_name.clone(), source));
                assets.push(asset_name.clone());
            }
            if !module.css().is_empty() {
                commands.push(Command::define(DefineKind::Css, format!("{module_name}.css"), module.css()));
            }
            commands.push(Command::define(DefineKind::JsEval, format!("{module_name}.js"), module.source()));
        }

        let delivered: Vec<String> =
            order.modules.iter().map(|m| m.name().to_string()).collect();
        drop(order);
        drop(store);

        self.present_modules.extend(delivered);
        self.delivered_assets.extend(assets);
        self.present_classes.insert(qualified);
        for command in commands {
            self.send(command);
        }
        Ok(())
    }

    /// Send per-session binary data and return its link.
    ///
    /// # Errors
    ///
    /// - `SessionError::DuplicateData` if the name was used in this session
    /// - `SessionError::Asset` for an ill-formed name
    pub fn add_data(&mut self, name: &str, data: &Bytes) -> Result<String, SessionError> {
        validate_name(name)?;
        if !self.data_names.insert(name.to_string()) {
            return Err(SessionError::DuplicateData(name.to_string()));
        }
        self.send(Command::define(DefineKind::Data, name, BASE64.encode(data)));
        Ok(format!("tether/data/{}/{name}", self.id))
    }

    /// Keep `mirror` alive for `cycles` more heartbeat round trips. Returns
    /// the effective expiry counter.
    pub fn keep_alive(&mut self, mirror: &Mirror, cycles: u64) -> u64 {
        self.guards.register(mirror.id(), mirror.clone(), self.ping_counter + cycles)
    }

    /// Run `callback` once the next heartbeat round trip completes.
    ///
    /// Dropped without running if the session closes first.
    pub fn call_after_roundtrip(&mut self, callback: impl FnOnce(&mut Session) + 'static) {
        if self.status != SessionStatus::Closed {
            self.roundtrips.push((self.ping_counter + 1, Box::new(callback)));
        }
    }

    /// Round-trip callbacks not yet run.
    pub fn pending_roundtrips(&self) -> usize {
        self.roundtrips.len()
    }

    /// Advance the heartbeat counter and send `PING`. Returns the new count.
    pub fn ping(&mut self) -> u64 {
        self.ping_counter += 1;
        self.send(Command::Ping { count: self.ping_counter });
        self.ping_counter
    }

    /// Process a `PONG`: release expired guards, run completed round-trip
    /// callbacks, and collect dropped mirrors.
    pub fn handle_pong(&mut self, count: u64) {
        let released = self.guards.release_through(count);
        if !released.is_empty() {
            tracing::debug!(session_id = %self.id, released = released.len(), "keep-alive guards released");
        }
        drop(released);

        let (done, waiting): (Vec<_>, Vec<_>) = self.roundtrips.drain(..).partition(|(due, _)| *due <= count);
        self.roundtrips = waiting;
        for (_, callback) in done {
            // A callback may close the session
            if self.status == SessionStatus::Closed {
                return;
            }
            callback(self);
        }

        self.collect_garbage();
    }

    /// Drop registry entries whose mirror no longer exists and tell the
    /// remote to dispose them. Returns how many were collected.
    pub fn collect_garbage(&mut self) -> usize {
        let dropped: Vec<String> =
            self.registry.iter().filter(|(_, weak)| weak.upgrade().is_none()).map(|(id, _)| id.clone()).collect();
        for id in &dropped {
            self.forget_mirror(id, true);
            self.send(Command::Dispose { id: id.clone() });
        }
        if !dropped.is_empty() {
            tracing::debug!(session_id = %self.id, collected = dropped.len(), "collected dropped mirrors");
        }
        dropped.len()
    }

    /// Run a task previously handed out in [`SessionAction::Schedule`].
    pub fn run_task(&mut self, task: SessionTask) {
        if self.status == SessionStatus::Closed {
            return;
        }
        match task {
            SessionTask::Flush { id } => {
                if let Some(mirror) = self.mirror(&id) {
                    mirror.flush(self);
                }
            },
        }
    }

    /// Handle a command from the remote peer.
    ///
    /// Malformed or unexpected commands are logged and dropped.
    pub fn receive(&mut self, command: Command) {
        if self.status == SessionStatus::Closed {
            tracing::debug!(session_id = %self.id, verb = command.verb_str(), "inbound on closed session ignored");
            return;
        }

        match command {
            Command::SetProp { id, name, value } => {
                if let Some(mirror) = self.inbound_target(&id) {
                    mirror.queue_inbound(self, Inbound::Prop { name, value });
                }
            },
            Command::Event { id, kind, payload } => {
                if let Some(mirror) = self.inbound_target(&id) {
                    mirror.queue_inbound(self, Inbound::Event { kind, payload });
                }
            },
            Command::SetEventTypes { id, types } => {
                if let Some(mirror) = self.inbound_target(&id) {
                    mirror.set_remote_event_types(types);
                }
            },
            Command::Dispose { id } => {
                if let Some(mirror) = self.inbound_target(&id) {
                    mirror.dispose_from_remote(self);
                    self.send(Command::DisposeAck { id });
                }
            },
            Command::DisposeAck { id } => {
                if !self.dead_ids.remove(&id) {
                    tracing::debug!(session_id = %self.id, mirror = %id, "unexpected DISPOSE_ACK");
                }
            },
            Command::Instantiate { id, class, props, event_types } => {
                self.adopt_remote(id, &class, props, event_types);
            },
            Command::Invoke { id, action, args } => {
                if let Some(mirror) = self.inbound_target(&id) {
                    mirror.invoke(self, &action, &args);
                }
            },
            Command::EvalResult { value, eval_id } => match self.evals.remove(&eval_id) {
                Some(callback) => callback(self, value),
                None => tracing::warn!(session_id = %self.id, eval_id, "EVALRESULT for unknown eval ignored"),
            },
            Command::Ping { count } => self.send(Command::Pong { count }),
            Command::Pong { count } => self.handle_pong(count),
            Command::Diagnostic { level, text } => self.log_remote(level, &text),
            Command::Unknown { verb, .. } => {
                tracing::warn!(session_id = %self.id, %verb, "unknown command ignored");
            },
            other => {
                tracing::warn!(session_id = %self.id, verb = other.verb_str(), "unexpected inbound command ignored");
            },
        }
    }

    /// Host half of an object the remote instantiated. Held by a keep-alive
    /// guard until something attaches it or a round trip passes.
    fn adopt_remote(&mut self, id: String, class_name: &str, props: Map<String, Value>, event_types: Vec<String>) {
        if let Some(existing) = self.mirror(&id) {
            self.keep_alive(&existing, 1);
            return;
        }
        if self.dead_ids.contains(&id) {
            tracing::debug!(session_id = %self.id, mirror = %id, "INSTANTIATE for disposed mirror ignored");
            return;
        }
        let Some(class) = std::cell::RefCell::borrow(&self.store).class(class_name) else {
            tracing::warn!(session_id = %self.id, mirror = %id, class = class_name, "cannot instantiate unknown class");
            return;
        };

        match Mirror::adopt(self, class, id.clone(), props, event_types) {
            Ok(mirror) => {
                self.remote_ids.insert(id);
                self.keep_alive(&mirror, 1);
                tracing::debug!(session_id = %self.id, mirror = %mirror.id(), "remote instantiated mirror");
            },
            Err(err) => tracing::warn!(session_id = %self.id, mirror = %id, %err, "remote INSTANTIATE rejected"),
        }
    }

    fn inbound_target(&self, id: &str) -> Option<Mirror> {
        if self.dead_ids.contains(id) {
            tracing::debug!(session_id = %self.id, mirror = %id, "inbound for disposed mirror ignored");
            return None;
        }
        let mirror = self.mirror(id);
        if mirror.is_none() {
            tracing::warn!(session_id = %self.id, mirror = %id, "inbound for unknown mirror ignored");
        }
        mirror
    }

    fn log_remote(&self, level: DiagnosticLevel, text: &str) {
        match level {
            DiagnosticLevel::Print | DiagnosticLevel::Info => {
                tracing::info!(session_id = %self.id, "remote: {text}");
            },
            DiagnosticLevel::Warn => tracing::warn!(session_id = %self.id, "remote: {text}"),
            DiagnosticLevel::Error => tracing::error!(session_id = %self.id, "remote: {text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AssetStore;

    fn session() -> Session {
        Session::new(SessionId::from("s1"), "app", AssetStore::new().into_shared(), SessionConfig::default())
    }

    fn sent(actions: Vec<SessionAction>) -> Vec<Command> {
        actions
            .into_iter()
            .filter_map(|a| match a {
                SessionAction::Send(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn pending_queue_flushes_in_order_then_init_done() {
        let mut s = session();
        s.send(Command::define(DefineKind::Js, "m1", "var m1;"));
        s.exec("x=1");
        assert!(s.take_actions().is_empty());
        assert_eq!(s.queued(), 2);

        s.attach().unwrap();
        assert_eq!(sent(s.take_actions()), vec![
            Command::define(DefineKind::Js, "m1", "var m1;"),
            Command::exec("x=1"),
            Command::InitDone,
        ]);
        assert_eq!(s.status(), SessionStatus::Connected);
    }

    #[test]
    fn second_attach_fails() {
        let mut s = session();
        s.attach().unwrap();
        assert_eq!(s.attach(), Err(SessionError::AlreadyAttached("s1".into())));

        s.close();
        assert!(matches!(s.attach(), Err(SessionError::InvalidState { status: SessionStatus::Closed, .. })));
    }

    #[test]
    fn send_after_close_is_a_no_op() {
        let mut s = session();
        s.attach().unwrap();
        s.take_actions();
        s.close();
        s.exec("late()");
        assert!(s.take_actions().is_empty());
        s.close();
        assert_eq!(s.status(), SessionStatus::Closed);
    }

    #[test]
    fn ping_pong_and_roundtrips() {
        use std::{cell::Cell, rc::Rc};

        let mut s = session();
        s.attach().unwrap();
        s.take_actions();

        let ran = Rc::new(Cell::new(0));
        let counter = Rc::clone(&ran);
        s.call_after_roundtrip(move |session| {
            counter.set(counter.get() + 1);
            session.exec("settled()");
        });
        assert_eq!(s.ping(), 1);
        s.receive(Command::Pong { count: 0 });
        assert_eq!(ran.get(), 0);
        assert_eq!(sent(s.take_actions()), vec![Command::Ping { count: 1 }]);

        s.receive(Command::Pong { count: 1 });
        s.receive(Command::Pong { count: 2 });
        assert_eq!(ran.get(), 1);
        assert_eq!(s.pending_roundtrips(), 0);
        assert_eq!(sent(s.take_actions()), vec![Command::exec("settled()")]);
    }

    #[test]
    fn closing_drops_pending_roundtrips_and_evals() {
        use std::{cell::Cell, rc::Rc};

        let ran = Rc::new(Cell::new(false));
        let mut s = session();
        s.attach().unwrap();
        let (a, b) = (Rc::clone(&ran), Rc::clone(&ran));
        s.call_after_roundtrip(move |_| a.set(true));
        s.eval("1 + 1", move |_, _| b.set(true));
        s.close();

        s.receive(Command::Pong { count: 1 });
        s.receive(Command::EvalResult { value: Value::from(2), eval_id: 0 });
        assert!(!ran.get());
        assert_eq!(s.pending_roundtrips(), 0);
        assert_eq!(s.pending_evals(), 0);
    }

    #[test]
    fn eval_results_are_matched_by_id() {
        use std::{cell::RefCell, rc::Rc};

        let mut s = session();
        s.attach().unwrap();
        s.take_actions();

        let results = Rc::new(RefCell::new(Vec::new()));
        let (first, second) = (Rc::clone(&results), Rc::clone(&results));
        assert_eq!(s.eval("a", move |_, value| first.borrow_mut().push(("a", value))), 0);
        assert_eq!(s.eval("b", move |_, value| second.borrow_mut().push(("b", value))), 1);
        assert_eq!(sent(s.take_actions()), vec![
            Command::EvalAndReturn { code: "a".into(), eval_id: 0 },
            Command::EvalAndReturn { code: "b".into(), eval_id: 1 },
        ]);

        s.receive(Command::EvalResult { value: Value::from("B"), eval_id: 1 });
        s.receive(Command::EvalResult { value: Value::from("again"), eval_id: 1 });
        s.receive(Command::EvalResult { value: Value::Null, eval_id: 0 });
        assert_eq!(*RefCell::borrow(&results), vec![("b", Value::from("B")), ("a", Value::Null)]);
        assert_eq!(s.pending_evals(), 0);
    }

    #[test]
    fn inbound_ping_is_answered() {
        let mut s = session();
        s.attach().unwrap();
        s.take_actions();
        s.receive(Command::Ping { count: 3 });
        assert_eq!(sent(s.take_actions()), vec![Command::Pong { count: 3 }]);
    }

    #[test]
    fn add_data_sends_base64_and_rejects_duplicates() {
        let mut s = session();
        s.attach().unwrap();
        s.take_actions();

        let link = s.add_data("pixels", &Bytes::from_static(b"\x00\x01")).unwrap();
        assert_eq!(link, "tether/data/s1/pixels");
        assert_eq!(sent(s.take_actions()), vec![Command::define(DefineKind::Data, "pixels", "AAE=")]);
        assert_eq!(
            s.add_data("pixels", &Bytes::new()),
            Err(SessionError::DuplicateData("pixels".into()))
        );
    }

    #[test]
    fn runtime_is_closed_with_the_session() {
        use std::{cell::Cell, rc::Rc};

        struct Runtime(Rc<Cell<bool>>);
        impl RuntimeHandle for Runtime {
            fn close(&mut self) {
                self.0.set(true);
            }
        }

        let closed = Rc::new(Cell::new(false));
        let mut s = session();
        s.set_runtime(Box::new(Runtime(Rc::clone(&closed)))).unwrap();
        assert_eq!(
            s.set_runtime(Box::new(Runtime(Rc::new(Cell::new(false))))),
            Err(SessionError::RuntimeAlreadySet)
        );
        s.close();
        assert!(closed.get());
    }

    #[test]
    fn generated_ids_use_the_alphabet() {
        #[derive(Clone)]
        struct Counting;
        impl Environment for Counting {
            type Instant = std::time::Instant;
            fn now(&self) -> Self::Instant {
                std::time::Instant::now()
            }
            async fn sleep(&self, _duration: Duration) {}
            fn random_bytes(&self, buffer: &mut [u8]) {
                for (i, b) in buffer.iter_mut().enumerate() {
                    *b = (i * 13) as u8;
                }
            }
        }

        let id = SessionId::generate(&Counting);
        assert_eq!(id.as_str().len(), SESSION_ID_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
