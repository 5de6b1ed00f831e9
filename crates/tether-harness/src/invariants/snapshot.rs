//! Observable state snapshots for invariant checking.
//!
//! Snapshots copy both sides of a session at one instant, so checks never
//! observe a half-applied flush.

use std::collections::BTreeMap;

use serde_json::Value;
use tether_core::{
    Session,
    mirror::{CHILDREN_ATTRIBUTE, PARENT_ATTRIBUTE},
};

use crate::remote::RemotePeer;

/// Snapshot of every observed session.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Per-session snapshots.
    pub sessions: Vec<SessionSnapshot>,
}

impl SystemSnapshot {
    /// Snapshot of one session and its remote.
    pub fn capture(session: &Session, peer: &RemotePeer) -> Self {
        Self { sessions: vec![SessionSnapshot::capture(session, peer)] }
    }

    /// Add another session.
    pub fn add(&mut self, session: &Session, peer: &RemotePeer) {
        self.sessions.push(SessionSnapshot::capture(session, peer));
    }
}

/// Host object with its syncable values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSnapshot {
    /// Class name
    pub class: String,
    /// Syncable attribute values
    pub props: BTreeMap<String, Value>,
}

impl ObjectSnapshot {
    /// Parent id, if the class has a tree and the object has a parent.
    pub fn parent(&self) -> Option<&str> {
        self.props.get(PARENT_ATTRIBUTE).and_then(Value::as_str)
    }

    /// Child ids (empty when the class has no tree).
    pub fn children(&self) -> Vec<&str> {
        self.props
            .get(CHILDREN_ATTRIBUTE)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Both sides of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Session id
    pub session_id: String,
    /// Live host objects by id
    pub host: BTreeMap<String, ObjectSnapshot>,
    /// Remote objects by id
    pub remote: BTreeMap<String, ObjectSnapshot>,
}

impl SessionSnapshot {
    /// Copy the live host mirrors and the remote model.
    pub fn capture(session: &Session, peer: &RemotePeer) -> Self {
        let host = session
            .mirrors()
            .into_iter()
            .map(|mirror| {
                let props = mirror
                    .class()
                    .all_attributes()
                    .into_iter()
                    .filter(|attr| attr.sync.is_syncable())
                    .filter_map(|attr| mirror.get(attr.name).map(|value| (attr.name.to_string(), value)))
                    .collect();
                (mirror.id(), ObjectSnapshot { class: mirror.class().name.to_string(), props })
            })
            .collect();

        let remote = peer
            .objects()
            .iter()
            .map(|(id, object)| {
                let props = object.props.iter().map(|(name, value)| (name.clone(), value.clone())).collect();
                (id.clone(), ObjectSnapshot { class: object.class.clone(), props })
            })
            .collect();

        Self { session_id: session.id().to_string(), host, remote }
    }
}
