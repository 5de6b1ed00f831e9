//! Session Manager
//!
//! Owns every session of the process, grouped by application. Each
//! application has a behavior factory ([`Application`]), a pending list
//! (sessions created but not yet claimed by a peer) and a connected list.
//!
//! Sessions must be created through the manager; attaching moves a session
//! from pending to connected exactly once. Abandoned pending sessions are
//! reaped after [`ManagerConfig::pending_timeout`].
//!
//! Generic over `I` (Instant type) to support virtual time in tests.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    rc::Rc,
    time::Duration,
};

use tether_core::{
    Mirror, MirrorError, Session, SessionConfig, SessionError, SessionId, SessionStatus, SharedStore,
    env::Environment,
};
use tokio::sync::broadcast;

/// Reserved name that can never be registered.
pub const DEFAULT_APP_NAME: &str = "__default__";

/// Default time a session may stay pending before it is reaped.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Default minimum spacing of reap sweeps triggered by session creation.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5);

const NOTIFY_CAPACITY: usize = 64;

/// Per-application behavior factory.
pub trait Application {
    /// Build the root mirror of a new session.
    ///
    /// # Errors
    ///
    /// Any mirror failure aborts session creation.
    fn create(&self, session: &mut Session) -> Result<Mirror, MirrorError>;

    /// Called for every connected session of this application when the
    /// number of connected sessions changes.
    fn connections_changed(&self, _session: &mut Session, _count: usize) {}
}

/// Connected-set membership changed for an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionsChanged {
    /// Application name
    pub app: String,
    /// Connected sessions after the change
    pub count: usize,
}

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a session may wait for its peer
    pub pending_timeout: Duration,
    /// Minimum spacing of sweeps triggered by [`SessionManager::create_session`]
    pub reap_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { pending_timeout: DEFAULT_PENDING_TIMEOUT, reap_interval: DEFAULT_REAP_INTERVAL }
    }
}

/// Errors from session manager operations
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Name is empty or outside `[A-Za-z_][A-Za-z0-9_]*`
    #[error("invalid application name: {0:?}")]
    InvalidAppName(String),

    /// Name is reserved
    #[error("application name is reserved: {0}")]
    ReservedAppName(String),

    /// No application with this name
    #[error("unknown application: {0}")]
    UnknownApp(String),

    /// No pending or connected session with this id for the application
    #[error("no session {session_id} for application {app}")]
    SessionNotFound {
        /// Application the caller named
        app: String,
        /// Session id the caller named
        session_id: String,
    },

    /// The application failed to build its root mirror
    #[error("application {app} failed to start a session: {source}")]
    AppFailed {
        /// Application name
        app: String,
        /// Underlying failure
        source: MirrorError,
    },

    /// Session state error (duplicate attach, closed session)
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Whether `name` may be used as an application name.
pub fn valid_app_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        },
        _ => false,
    }
}

struct AppEntry<I> {
    app: Rc<dyn Application>,
    /// Pending session id -> creation time
    pending: BTreeMap<SessionId, I>,
    connected: BTreeSet<SessionId>,
}

/// Owns sessions across all applications.
pub struct SessionManager<I = std::time::Instant> {
    store: SharedStore,
    config: ManagerConfig,
    session_config: SessionConfig,
    apps: BTreeMap<String, AppEntry<I>>,
    sessions: HashMap<SessionId, Session>,
    total_sessions: u64,
    last_reap: Option<I>,
    notify: broadcast::Sender<ConnectionsChanged>,
}

impl<I> SessionManager<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Create a manager whose sessions deliver from `store`.
    pub fn new(store: SharedStore, config: ManagerConfig, session_config: SessionConfig) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            store,
            config,
            session_config,
            apps: BTreeMap::new(),
            sessions: HashMap::new(),
            total_sessions: 0,
            last_reap: None,
            notify,
        }
    }

    /// Register (or replace) an application.
    ///
    /// Re-registering a name replaces its factory and keeps its sessions;
    /// this is logged, not rejected.
    pub fn register_app(&mut self, name: &str, app: impl Application + 'static) -> Result<(), ManagerError> {
        if name == DEFAULT_APP_NAME {
            return Err(ManagerError::ReservedAppName(name.to_string()));
        }
        if !valid_app_name(name) {
            return Err(ManagerError::InvalidAppName(name.to_string()));
        }

        let app: Rc<dyn Application> = Rc::new(app);
        match self.apps.get_mut(name) {
            Some(entry) => {
                tracing::warn!(app = name, "application re-registered; replacing factory");
                entry.app = app;
            },
            None => {
                tracing::info!(app = name, "application registered");
                self.apps.insert(name.to_string(), AppEntry {
                    app,
                    pending: BTreeMap::new(),
                    connected: BTreeSet::new(),
                });
            },
        }
        Ok(())
    }

    /// Canonical spelling of a registered name, matched case-insensitively.
    pub fn has_app_name(&self, name: &str) -> Option<&str> {
        self.apps.keys().find(|known| known.eq_ignore_ascii_case(name)).map(String::as_str)
    }

    /// Registered application names, sorted.
    pub fn app_names(&self) -> Vec<&str> {
        self.apps.keys().map(String::as_str).collect()
    }

    /// Create a pending session for `app` and build its root mirror.
    ///
    /// Sweeps abandoned pending sessions first if the last sweep is older
    /// than [`ManagerConfig::reap_interval`].
    ///
    /// # Errors
    ///
    /// - `ManagerError::UnknownApp` if `app` is not registered
    /// - `ManagerError::AppFailed` if the application could not build its
    ///   root mirror; the half-built session is closed
    pub fn create_session<E: Environment<Instant = I>>(
        &mut self,
        app: &str,
        env: &E,
    ) -> Result<SessionId, ManagerError> {
        let now = env.now();
        if self.last_reap.is_none_or(|last| now - last >= self.config.reap_interval) {
            self.reap_pending(now);
        }

        let entry = self.apps.get(app).ok_or_else(|| ManagerError::UnknownApp(app.to_string()))?;
        let factory = Rc::clone(&entry.app);

        let id = SessionId::generate(env);
        let mut session = Session::new(id.clone(), app, Rc::clone(&self.store), self.session_config.clone());
        match factory.create(&mut session) {
            Ok(root) => session.set_root(root),
            Err(source) => {
                session.close();
                return Err(ManagerError::AppFailed { app: app.to_string(), source });
            },
        }

        if let Some(entry) = self.apps.get_mut(app) {
            entry.pending.insert(id.clone(), now);
        }
        self.sessions.insert(id.clone(), session);
        self.total_sessions += 1;
        tracing::debug!(session_id = %id, app, "session created");
        Ok(id)
    }

    /// Bind the peer for a pending session.
    ///
    /// Only one attach per session can succeed; the session's queued
    /// commands are flushed into its actions.
    ///
    /// # Errors
    ///
    /// - `ManagerError::UnknownApp` if `app` is not registered
    /// - `ManagerError::SessionNotFound` if `id` is not a session of `app`
    ///   (never created, reaped, or closed)
    /// - `ManagerError::Session` if the session is already attached
    pub fn attach(&mut self, app: &str, id: &SessionId) -> Result<(), ManagerError> {
        let entry = self.apps.get_mut(app).ok_or_else(|| ManagerError::UnknownApp(app.to_string()))?;
        let not_found = || ManagerError::SessionNotFound { app: app.to_string(), session_id: id.to_string() };
        if !entry.pending.contains_key(id) && !entry.connected.contains(id) {
            return Err(not_found());
        }
        let session = self.sessions.get_mut(id).ok_or_else(not_found)?;

        session.attach()?;
        entry.pending.remove(id);
        entry.connected.insert(id.clone());
        self.connections_changed(app);
        Ok(())
    }

    /// Close a session and forget it. Returns `false` for unknown ids.
    pub fn close_session(&mut self, id: &SessionId) -> bool {
        let Some(mut session) = self.sessions.remove(id) else {
            return false;
        };
        let app = session.app_name().to_string();
        session.close();

        let was_connected = self.apps.get_mut(&app).is_some_and(|entry| {
            entry.pending.remove(id);
            entry.connected.remove(id)
        });
        if was_connected {
            self.connections_changed(&app);
        }
        true
    }

    /// Forget sessions that were closed directly, without going through
    /// [`close_session`](Self::close_session). Returns their ids.
    pub fn sweep_closed(&mut self) -> Vec<SessionId> {
        let closed: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.status() == SessionStatus::Closed)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &closed {
            self.close_session(id);
        }
        closed
    }

    /// Close every pending session created more than
    /// [`ManagerConfig::pending_timeout`] before `now`. Returns the reaped ids.
    pub fn reap_pending(&mut self, now: I) -> Vec<SessionId> {
        self.last_reap = Some(now);
        let timeout = self.config.pending_timeout;
        let expired: Vec<SessionId> = self
            .apps
            .values()
            .flat_map(|entry| entry.pending.iter())
            .filter(|(_, created)| now - **created > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            tracing::info!(session_id = %id, "reaping session that never attached");
            self.close_session(id);
        }
        expired
    }

    /// Session by id.
    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Mutable session by id.
    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Every live session.
    pub fn sessions_mut(&mut self) -> impl Iterator<Item = (&SessionId, &mut Session)> {
        self.sessions.iter_mut()
    }

    /// Connected sessions of `app`.
    pub fn connections(&self, app: &str) -> Vec<&SessionId> {
        self.apps.get(app).map(|entry| entry.connected.iter().collect()).unwrap_or_default()
    }

    /// Pending sessions of `app`.
    pub fn pending(&self, app: &str) -> Vec<&SessionId> {
        self.apps.get(app).map(|entry| entry.pending.keys().collect()).unwrap_or_default()
    }

    /// Sessions created since startup.
    pub fn total_sessions(&self) -> u64 {
        self.total_sessions
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Observe connected-set changes from outside the loop.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionsChanged> {
        self.notify.subscribe()
    }

    fn connections_changed(&mut self, app: &str) {
        let Some(entry) = self.apps.get(app) else { return };
        let count = entry.connected.len();
        let factory = Rc::clone(&entry.app);
        let connected: Vec<SessionId> = entry.connected.iter().cloned().collect();

        // No receivers is fine
        let _ = self.notify.send(ConnectionsChanged { app: app.to_string(), count });

        for id in &connected {
            if let Some(session) = self.sessions.get_mut(id) {
                if session.status() == SessionStatus::Connected {
                    factory.connections_changed(session, count);
                }
            }
        }
        tracing::debug!(app, count, "connections changed");
    }
}

impl<I> std::fmt::Debug for SessionManager<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("apps", &self.apps.keys().collect::<Vec<_>>())
            .field("sessions", &self.sessions.len())
            .field("total_sessions", &self.total_sessions)
            .finish_non_exhaustive()
    }
}
