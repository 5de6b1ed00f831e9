//! Built-in `monitor` application.
//!
//! Its root mirror mirrors the number of connected monitor sessions into a
//! synced `connections` attribute, so every open monitor sees the others
//! come and go.

use serde_json::json;
use tether_core::{Attribute, Mirror, MirrorClass, MirrorError, Session, SyncMode, ValueKind};

use crate::manager::Application;

/// Name the binary registers [`MonitorApp`] under.
pub const MONITOR_APP_NAME: &str = "monitor";

/// Root class of the monitor application.
pub static MONITOR: MirrorClass = MirrorClass {
    name: "Monitor",
    module: "tether.monitor",
    base: None,
    attributes: &[
        Attribute::new("title", SyncMode::Synced, ValueKind::Str),
        Attribute::new("connections", SyncMode::Synced, ValueKind::Int { min: Some(0), max: None }),
    ],
    css: ".tether-monitor { font-family: monospace; }",
};

/// Shows the live connection count of its own application.
#[derive(Debug, Clone, Default)]
pub struct MonitorApp {
    title: String,
}

impl MonitorApp {
    /// Monitor whose root carries `title`.
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into() }
    }
}

impl Application for MonitorApp {
    fn create(&self, session: &mut Session) -> Result<Mirror, MirrorError> {
        Mirror::create(session, &MONITOR, [("title", json!(self.title))])
    }

    fn connections_changed(&self, session: &mut Session, count: usize) {
        let Some(root) = session.root().cloned() else { return };
        if let Err(err) = root.set(session, "connections", json!(count)) {
            tracing::warn!(session_id = %session.id(), error = %err, "monitor could not update connections");
        }
    }
}
