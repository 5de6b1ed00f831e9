//! Scripted model of the remote runtime.
//!
//! [`RemotePeer`] consumes host commands the way a real remote would:
//! it builds objects from `INSTANTIATE`, applies `SET_PROP` without echoing,
//! answers `PING`, `DISPOSE` and `EVALANDRETURN`, and records everything it
//! was sent. Tests drive the other direction through [`RemotePeer::set`],
//! [`RemotePeer::listen`], [`RemotePeer::event`], [`RemotePeer::dispose`],
//! [`RemotePeer::instantiate`] and [`RemotePeer::invoke`], which update the
//! model and return the command to deliver.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use tether_proto::{Command, DefineKind};

/// Remote half of one mirror object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteObject {
    /// Class name from `INSTANTIATE`
    pub class: String,
    /// Current property values
    pub props: Map<String, Value>,
    /// Event types the host handles for this object
    pub host_event_types: Vec<String>,
    /// Event types this side listens to
    pub listening: BTreeSet<String>,
    /// Events received from the host, in order
    pub events: Vec<(String, Value)>,
}

/// Simulated remote peer.
#[derive(Debug)]
pub struct RemotePeer {
    objects: BTreeMap<String, RemoteObject>,
    defines: Vec<(DefineKind, String, String)>,
    execs: Vec<String>,
    evals: Vec<String>,
    eval_answer: Value,
    initialized: bool,
    close: Option<(u16, String)>,
    last_ping: Option<u64>,
    answer_pings: bool,
    /// Ids this side disposed that the host has not acknowledged
    awaiting_ack: BTreeSet<String>,
    received: usize,
}

impl Default for RemotePeer {
    fn default() -> Self {
        Self::new()
    }
}

impl RemotePeer {
    /// Peer that answers every ping.
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            defines: Vec::new(),
            execs: Vec::new(),
            evals: Vec::new(),
            eval_answer: Value::Null,
            initialized: false,
            close: None,
            last_ping: None,
            answer_pings: true,
            awaiting_ack: BTreeSet::new(),
            received: 0,
        }
    }

    /// Peer that never answers pings (a hung runtime).
    #[must_use]
    pub fn unresponsive(mut self) -> Self {
        self.answer_pings = false;
        self
    }

    /// Peer that answers every `EVALANDRETURN` with `value`.
    #[must_use]
    pub fn answering_evals_with(mut self, value: Value) -> Self {
        self.eval_answer = value;
        self
    }

    /// `HELLO` for `app`, attaching to `session_id` when given.
    pub fn hello(app: &str, session_id: Option<&str>) -> Command {
        Command::Hello { app: app.to_string(), session_id: session_id.map(str::to_string) }
    }

    /// Apply one host command; returns the replies to send back.
    pub fn apply(&mut self, command: &Command) -> Vec<Command> {
        self.received += 1;
        match command {
            Command::Define { kind, name, source } => self.defines.push((*kind, name.clone(), source.clone())),
            Command::Exec { code } => self.execs.push(code.clone()),
            Command::InitDone => self.initialized = true,
            Command::Instantiate { id, class, props, event_types } => {
                self.objects.insert(id.clone(), RemoteObject {
                    class: class.clone(),
                    props: props.clone(),
                    host_event_types: event_types.clone(),
                    ..RemoteObject::default()
                });
            },
            Command::Dispose { id } => {
                self.objects.remove(id);
                return vec![Command::DisposeAck { id: id.clone() }];
            },
            Command::DisposeAck { id } => {
                self.awaiting_ack.remove(id);
            },
            Command::SetProp { id, name, value } => match self.objects.get_mut(id) {
                Some(object) => {
                    object.props.insert(name.clone(), value.clone());
                },
                None => tracing::debug!(mirror = %id, "remote: SET_PROP for unknown object"),
            },
            Command::SetEventTypes { id, types } => {
                if let Some(object) = self.objects.get_mut(id) {
                    object.host_event_types.clone_from(types);
                }
            },
            Command::Event { id, kind, payload } => {
                if let Some(object) = self.objects.get_mut(id) {
                    object.events.push((kind.clone(), payload.clone()));
                }
            },
            Command::Ping { count } => {
                self.last_ping = Some(*count);
                if self.answer_pings {
                    return vec![Command::Pong { count: *count }];
                }
            },
            Command::EvalAndReturn { code, eval_id } => {
                self.evals.push(code.clone());
                return vec![Command::EvalResult { value: self.eval_answer.clone(), eval_id: *eval_id }];
            },
            Command::Close { code, reason } => self.close = Some((*code, reason.clone())),
            other => tracing::debug!(verb = other.verb_str(), "remote: ignoring command"),
        }
        Vec::new()
    }

    /// Apply host commands in order; returns all replies.
    pub fn apply_all<'a>(&mut self, commands: impl IntoIterator<Item = &'a Command>) -> Vec<Command> {
        commands.into_iter().flat_map(|command| self.apply(command)).collect()
    }

    /// Set a property on this side and produce the `SET_PROP` for the host.
    pub fn set(&mut self, id: &str, name: &str, value: Value) -> Command {
        if let Some(object) = self.objects.get_mut(id) {
            object.props.insert(name.to_string(), value.clone());
        }
        Command::SetProp { id: id.to_string(), name: name.to_string(), value }
    }

    /// Replace this side's listened event types for `id`.
    pub fn listen(&mut self, id: &str, types: &[&str]) -> Command {
        if let Some(object) = self.objects.get_mut(id) {
            object.listening = types.iter().map(|t| (*t).to_string()).collect();
        }
        Command::SetEventTypes { id: id.to_string(), types: types.iter().map(|t| (*t).to_string()).collect() }
    }

    /// Emit an event toward the host.
    pub fn event(&self, id: &str, kind: &str, payload: Value) -> Command {
        Command::Event { id: id.to_string(), kind: kind.to_string(), payload }
    }

    /// Create an object on this side and produce the `INSTANTIATE` for the
    /// host.
    pub fn instantiate(&mut self, id: &str, class: &str, props: Map<String, Value>) -> Command {
        self.objects.insert(id.to_string(), RemoteObject {
            class: class.to_string(),
            props: props.clone(),
            ..RemoteObject::default()
        });
        Command::Instantiate { id: id.to_string(), class: class.to_string(), props, event_types: Vec::new() }
    }

    /// Call a host-side action of `id`.
    pub fn invoke(&self, id: &str, action: &str, args: Vec<Value>) -> Command {
        Command::Invoke { id: id.to_string(), action: action.to_string(), args }
    }

    /// Dispose on this side and produce the `DISPOSE` for the host.
    pub fn dispose(&mut self, id: &str) -> Command {
        self.objects.remove(id);
        self.awaiting_ack.insert(id.to_string());
        Command::Dispose { id: id.to_string() }
    }

    /// Object by id.
    pub fn object(&self, id: &str) -> Option<&RemoteObject> {
        self.objects.get(id)
    }

    /// All objects in id order.
    pub fn objects(&self) -> &BTreeMap<String, RemoteObject> {
        &self.objects
    }

    /// Property value of an object.
    pub fn prop(&self, id: &str, name: &str) -> Option<&Value> {
        self.objects.get(id)?.props.get(name)
    }

    /// Every `DEFINE-*` received, in order.
    pub fn defines(&self) -> &[(DefineKind, String, String)] {
        &self.defines
    }

    /// Names of everything defined, in order.
    pub fn defined_names(&self) -> Vec<&str> {
        self.defines.iter().map(|(_, name, _)| name.as_str()).collect()
    }

    /// Code received through `EXEC`.
    pub fn execs(&self) -> &[String] {
        &self.execs
    }

    /// Code received through `EVALANDRETURN`.
    pub fn evals(&self) -> &[String] {
        &self.evals
    }

    /// Whether `INIT-DONE` arrived.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// `CLOSE` code and reason, if the host closed the channel.
    pub fn close_reason(&self) -> Option<&(u16, String)> {
        self.close.as_ref()
    }

    /// Counter of the last `PING` received.
    pub fn last_ping(&self) -> Option<u64> {
        self.last_ping
    }

    /// Remote-initiated disposals the host has not acknowledged.
    pub fn awaiting_ack(&self) -> &BTreeSet<String> {
        &self.awaiting_ack
    }

    /// Number of host commands applied.
    pub fn received(&self) -> usize {
        self.received
    }
}
