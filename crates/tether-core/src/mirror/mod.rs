//! Mirror objects and the synchronization engine.
//!
//! A [`Mirror`] is the host half of a paired object. Its attributes follow
//! the [`SyncMode`] declared on its class:
//!
//! | Mode        | Host set               | Remote set                         |
//! |-------------|------------------------|------------------------------------|
//! | `Local`     | applied, never sent    | rejected                           |
//! | `Synced`    | applied, sent          | applied, never echoed              |
//! | `BothSides` | applied, sent          | applied, echoed as confirmation    |
//!
//! Every set is normalized first and setting an equal value does nothing.
//! For `BothSides` attributes the host is the convergence authority: its
//! normalized value always goes back to the remote, which applies host
//! values without echoing them. Concurrent sets from both sides therefore
//! converge on the host's value within one round trip.
//!
//! # Events
//!
//! Property changes and emitted events collect in a pending list and reach
//! handlers in one batch per flush. Host-originated changes flush on the
//! next scheduler turn; inbound wire items flush after the session's batch
//! window, so a burst arrives together. An event type is only sent to the
//! remote while the remote has announced a handler for it.
//!
//! # Remote-created objects and actions
//!
//! The remote may instantiate objects of classes the store knows; the host
//! adopts them under the remote's id (see [`Session`]'s handling of
//! `INSTANTIATE`). Remote code calls host behavior with `INVOKE`, which runs
//! the handler registered with [`Mirror::action`] straight away, outside the
//! event batch.
//!
//! # Tree
//!
//! A parent holds its children strongly, a child holds its parent weakly.
//! [`Mirror::set_parent`] keeps both sides and the `parent`/`children`
//! attribute values consistent; the session owns lifetimes.

mod class;

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    fmt,
    rc::{Rc, Weak},
    time::Duration,
};

pub use class::{Attribute, CHILDREN_ATTRIBUTE, MirrorClass, PARENT_ATTRIBUTE, SyncMode, ValueKind};
use serde_json::{Map, Value};
use tether_proto::Command;

use crate::{
    error::{MirrorError, SessionError},
    session::{Session, SessionId, SessionStatus, SessionTask},
};

/// Handler invoked with every event of one kind from one flush.
pub type Handler = Box<dyn FnMut(&mut Session, &Mirror, &[MirrorEvent])>;

type SharedHandler = Rc<RefCell<Handler>>;

/// Host action callable from the remote with `INVOKE`.
pub type Action = Box<dyn FnMut(&mut Session, &Mirror, &[Value])>;

type SharedAction = Rc<RefCell<Action>>;

/// Registration returned by [`Mirror::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Side a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Host code
    Host,
    /// The wire
    Remote,
}

/// One change or emitted event.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorEvent {
    /// Mirror id
    pub source: String,
    /// Event type; the attribute name for property changes
    pub kind: String,
    /// Where the change came from
    pub origin: Origin,
    /// Previous value (property changes only)
    pub old: Value,
    /// New value (property changes only)
    pub new: Value,
    /// Event payload (emitted events only)
    pub payload: Value,
}

/// Wire item waiting for the batch flush.
#[derive(Debug)]
pub(crate) enum Inbound {
    Prop { name: String, value: Value },
    Event { kind: String, payload: Value },
}

struct MirrorState {
    id: String,
    session_id: SessionId,
    class: &'static MirrorClass,
    values: BTreeMap<&'static str, Value>,
    handlers: BTreeMap<String, Vec<(HandlerId, SharedHandler)>>,
    next_handler: u64,
    actions: BTreeMap<String, SharedAction>,
    remote_event_types: BTreeSet<String>,
    inbound: Vec<Inbound>,
    pending_events: Vec<MirrorEvent>,
    flush_scheduled: bool,
    disposed: bool,
    parent: Option<WeakMirror>,
    children: Vec<Mirror>,
}

/// Strong handle to a mirror object.
#[derive(Clone)]
pub struct Mirror(Rc<RefCell<MirrorState>>);

/// Weak handle held by the session registry and by children.
#[derive(Clone)]
pub struct WeakMirror(Weak<RefCell<MirrorState>>);

impl WeakMirror {
    /// Strong handle, if the mirror still exists.
    pub fn upgrade(&self) -> Option<Mirror> {
        self.0.upgrade().map(Mirror)
    }
}

impl fmt::Debug for WeakMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(mirror) => write!(f, "WeakMirror({})", mirror.id()),
            None => f.write_str("WeakMirror(<dropped>)"),
        }
    }
}

impl fmt::Debug for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(state) => f
                .debug_struct("Mirror")
                .field("id", &state.id)
                .field("class", &state.class.name)
                .field("values", &state.values)
                .field("disposed", &state.disposed)
                .finish_non_exhaustive(),
            Err(_) => f.write_str("Mirror(<borrowed>)"),
        }
    }
}

impl Mirror {
    /// Create a mirror of `class` in `session`.
    ///
    /// Delivers the class' module if needed, normalizes `init` over the
    /// attribute defaults, registers the object and sends `INSTANTIATE` with
    /// the syncable values.
    ///
    /// # Errors
    ///
    /// - `MirrorError::Session` if the session is closed or module delivery
    ///   fails
    /// - `MirrorError::UnknownAttribute` / `MirrorError::Validation` for bad
    ///   initial values
    /// - `MirrorError::InvalidParent` if `init` names `parent` or `children`
    pub fn create<'a>(
        session: &mut Session,
        class: &'static MirrorClass,
        init: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Self, MirrorError> {
        if session.status() == SessionStatus::Closed {
            return Err(SessionError::InvalidState { status: SessionStatus::Closed, operation: "create a mirror in" }
                .into());
        }

        let mut values = BTreeMap::new();
        for attr in class.all_attributes() {
            values.insert(attr.name, attr.initial_value());
        }
        for (name, value) in init {
            if name == PARENT_ATTRIBUTE || name == CHILDREN_ATTRIBUTE {
                return Err(MirrorError::InvalidParent {
                    id: class.name.to_string(),
                    reason: "tree links are set with set_parent",
                });
            }
            let attr = class
                .attribute(name)
                .ok_or_else(|| MirrorError::UnknownAttribute { class: class.name, name: name.to_string() })?;
            let value = attr
                .kind
                .normalize(value)
                .map_err(|reason| MirrorError::Validation { attribute: name.to_string(), reason })?;
            values.insert(attr.name, value);
        }

        session.register_class(class)?;

        let id = session.allocate_id(class.name);
        let props: Map<String, Value> = class
            .all_attributes()
            .into_iter()
            .filter(|attr| attr.sync.is_syncable())
            .map(|attr| (attr.name.to_string(), values.get(attr.name).cloned().unwrap_or(Value::Null)))
            .collect();

        let mirror = Self::build(session, class, id.clone(), values, BTreeSet::new());
        session.send(Command::Instantiate { id, class: class.name.to_string(), props, event_types: Vec::new() });
        Ok(mirror)
    }

    /// Host half of an object the remote already instantiated as `id`.
    ///
    /// `props` are checked like remote sets: local attributes are refused
    /// and both-sides values the host normalizes differently are sent back.
    /// Tree links are ignored here; they arrive as `SET_PROP parent`.
    pub(crate) fn adopt(
        session: &mut Session,
        class: &'static MirrorClass,
        id: String,
        props: Map<String, Value>,
        event_types: Vec<String>,
    ) -> Result<Self, MirrorError> {
        let mut values = BTreeMap::new();
        for attr in class.all_attributes() {
            values.insert(attr.name, attr.initial_value());
        }

        let mut corrected = Vec::new();
        for (name, value) in props {
            if name == PARENT_ATTRIBUTE || name == CHILDREN_ATTRIBUTE {
                continue;
            }
            let attr = class
                .attribute(&name)
                .ok_or_else(|| MirrorError::UnknownAttribute { class: class.name, name: name.clone() })?;
            if !attr.sync.is_syncable() {
                return Err(MirrorError::NotSynced(name));
            }
            let normalized = attr
                .kind
                .normalize(value.clone())
                .map_err(|reason| MirrorError::Validation { attribute: name.clone(), reason })?;
            if attr.sync == SyncMode::BothSides && normalized != value {
                corrected.push((attr.name, normalized.clone()));
            }
            values.insert(attr.name, normalized);
        }

        let mirror = Self::build(session, class, id.clone(), values, event_types.into_iter().collect());
        for (name, value) in corrected {
            session.send(Command::SetProp { id: id.clone(), name: name.to_string(), value });
        }
        Ok(mirror)
    }

    fn build(
        session: &mut Session,
        class: &'static MirrorClass,
        id: String,
        values: BTreeMap<&'static str, Value>,
        remote_event_types: BTreeSet<String>,
    ) -> Self {
        let mirror = Self(Rc::new(RefCell::new(MirrorState {
            id,
            session_id: session.id().clone(),
            class,
            values,
            handlers: BTreeMap::new(),
            next_handler: 0,
            actions: BTreeMap::new(),
            remote_event_types,
            inbound: Vec::new(),
            pending_events: Vec::new(),
            flush_scheduled: false,
            disposed: false,
            parent: None,
            children: Vec::new(),
        })));
        session.register_mirror(&mirror);
        mirror
    }

    /// Mirror id
    pub fn id(&self) -> String {
        self.0.borrow().id.clone()
    }

    /// Mirror class
    pub fn class(&self) -> &'static MirrorClass {
        self.0.borrow().class
    }

    /// Current value of an attribute.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.borrow().values.get(name).cloned()
    }

    /// Whether the mirror was disposed.
    pub fn is_disposed(&self) -> bool {
        self.0.borrow().disposed
    }

    /// Parent, if set and still alive.
    pub fn parent(&self) -> Option<Self> {
        self.0.borrow().parent.as_ref().and_then(WeakMirror::upgrade)
    }

    /// Children in insertion order.
    pub fn children(&self) -> Vec<Self> {
        self.0.borrow().children.clone()
    }

    /// Event types the remote currently handles.
    pub fn remote_event_types(&self) -> Vec<String> {
        self.0.borrow().remote_event_types.iter().cloned().collect()
    }

    /// Weak handle
    pub fn downgrade(&self) -> WeakMirror {
        WeakMirror(Rc::downgrade(&self.0))
    }

    /// Whether both handles refer to the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Host-originated set. Returns whether the value changed.
    ///
    /// # Errors
    ///
    /// - `MirrorError::WrongSession` / `MirrorError::Disposed`
    /// - `MirrorError::UnknownAttribute` / `MirrorError::Validation`
    /// - `MirrorError::InvalidParent` for tree attributes (see
    ///   [`set_parent`](Self::set_parent))
    pub fn set(&self, session: &mut Session, name: &str, value: Value) -> Result<bool, MirrorError> {
        self.check_session(session)?;
        self.apply_set(session, name, value, Origin::Host)
    }

    /// Emit an event: local handlers see it on the next flush, and it is
    /// sent when the remote handles this type.
    ///
    /// Property names of syncable attributes are never sent as events; their
    /// changes already travel as `SET_PROP`.
    ///
    /// # Errors
    ///
    /// - `MirrorError::WrongSession` / `MirrorError::Disposed`
    pub fn emit(&self, session: &mut Session, kind: &str, payload: Value) -> Result<(), MirrorError> {
        self.check_live(session)?;
        let (id, send) = {
            let mut state = self.0.borrow_mut();
            let event = MirrorEvent {
                source: state.id.clone(),
                kind: kind.to_string(),
                origin: Origin::Host,
                old: Value::Null,
                new: Value::Null,
                payload: payload.clone(),
            };
            state.pending_events.push(event);
            let is_property = state.class.attribute(kind).is_some_and(|attr| attr.sync.is_syncable());
            (state.id.clone(), !is_property && state.remote_event_types.contains(kind))
        };
        self.schedule_flush(session, Duration::ZERO);
        if send {
            session.send(Command::Event { id, kind: kind.to_string(), payload });
        }
        Ok(())
    }

    /// Register a handler for `kind`. Announces the new active event-type
    /// set to the remote when `kind` had no handler before.
    ///
    /// # Errors
    ///
    /// - `MirrorError::WrongSession` / `MirrorError::Disposed`
    pub fn on(
        &self,
        session: &mut Session,
        kind: &str,
        handler: impl FnMut(&mut Session, &Mirror, &[MirrorEvent]) + 'static,
    ) -> Result<HandlerId, MirrorError> {
        self.check_live(session)?;
        let (handler_id, announce) = {
            let mut state = self.0.borrow_mut();
            let handler_id = HandlerId(state.next_handler);
            state.next_handler += 1;
            let handler: Handler = Box::new(handler);
            let list = state.handlers.entry(kind.to_string()).or_default();
            let first = list.is_empty();
            list.push((handler_id, Rc::new(RefCell::new(handler))));
            (handler_id, first)
        };
        if announce {
            self.announce_event_types(session);
        }
        Ok(handler_id)
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, session: &mut Session, handler: HandlerId) -> bool {
        let (found, emptied) = {
            let mut state = self.0.borrow_mut();
            let mut found = false;
            let mut emptied = None;
            for (kind, list) in &mut state.handlers {
                if let Some(pos) = list.iter().position(|(id, _)| *id == handler) {
                    list.remove(pos);
                    found = true;
                    if list.is_empty() {
                        emptied = Some(kind.clone());
                    }
                    break;
                }
            }
            if let Some(kind) = &emptied {
                state.handlers.remove(kind);
            }
            (found, emptied.is_some())
        };
        if emptied && !self.is_disposed() {
            self.announce_event_types(session);
        }
        found
    }

    /// Register `handler` as the action `name`, replacing an earlier one.
    ///
    /// # Errors
    ///
    /// - `MirrorError::WrongSession` / `MirrorError::Disposed`
    pub fn action(
        &self,
        session: &Session,
        name: &str,
        handler: impl FnMut(&mut Session, &Mirror, &[Value]) + 'static,
    ) -> Result<(), MirrorError> {
        self.check_live(session)?;
        let action: Action = Box::new(handler);
        if self.0.borrow_mut().actions.insert(name.to_string(), Rc::new(RefCell::new(action))).is_some() {
            tracing::debug!(mirror = %self.id(), action = name, "action replaced");
        }
        Ok(())
    }

    pub(crate) fn invoke(&self, session: &mut Session, name: &str, args: &[Value]) {
        let action = {
            let state = self.0.borrow();
            if state.disposed {
                return;
            }
            state.actions.get(name).map(Rc::clone)
        };
        let Some(action) = action else {
            tracing::warn!(session_id = %session.id(), mirror = %self.id(), action = name, "INVOKE of unknown action");
            return;
        };
        match action.try_borrow_mut() {
            Ok(mut action) => {
                let call: &mut Action = &mut action;
                call(session, self, args);
            },
            Err(_) => tracing::debug!(mirror = %self.id(), action = name, "action re-entered; skipped"),
        }
    }

    /// Move this mirror under `parent` (or detach it with `None`).
    ///
    /// # Errors
    ///
    /// - `MirrorError::WrongSession` / `MirrorError::Disposed`
    /// - `MirrorError::InvalidParent` if `parent` is this mirror or one of
    ///   its descendants
    pub fn set_parent(&self, session: &mut Session, parent: Option<&Self>) -> Result<(), MirrorError> {
        self.check_live(session)?;
        self.reparent(session, parent, Origin::Host)
    }

    /// Dispose the mirror: detach it from the tree, drop its handlers, send
    /// `DISPOSE`, and ignore further inbound traffic for its id until the
    /// remote acknowledges. Returns `false` if already disposed.
    ///
    /// # Errors
    ///
    /// - `MirrorError::WrongSession`
    pub fn dispose(&self, session: &mut Session) -> Result<bool, MirrorError> {
        self.check_session(session)?;
        if self.is_disposed() {
            return Ok(false);
        }
        let id = self.teardown(session);
        session.send(Command::Dispose { id: id.clone() });
        session.forget_mirror(&id, true);
        Ok(true)
    }

    pub(crate) fn dispose_from_remote(&self, session: &mut Session) {
        if !self.is_disposed() {
            let id = self.teardown(session);
            session.forget_mirror(&id, false);
        }
    }

    /// Mark disposed and cut links without telling anyone. Used when the
    /// whole session goes away.
    pub(crate) fn dispose_local(&self) {
        let children = {
            let mut state = self.0.borrow_mut();
            state.disposed = true;
            state.handlers.clear();
            state.actions.clear();
            state.inbound.clear();
            state.pending_events.clear();
            state.parent = None;
            std::mem::take(&mut state.children)
        };
        for child in children {
            child.0.borrow_mut().parent = None;
        }
    }

    fn teardown(&self, session: &mut Session) -> String {
        if self.parent().is_some() {
            self.link_parent(session, None, Origin::Host);
        }
        let children = std::mem::take(&mut self.0.borrow_mut().children);
        for child in children {
            child.0.borrow_mut().parent = None;
            child.write_tree(session, PARENT_ATTRIBUTE, Value::Null, Origin::Host);
        }

        let mut state = self.0.borrow_mut();
        state.disposed = true;
        state.handlers.clear();
        state.actions.clear();
        state.inbound.clear();
        state.pending_events.clear();
        state.id.clone()
    }

    pub(crate) fn queue_inbound(&self, session: &mut Session, item: Inbound) {
        self.0.borrow_mut().inbound.push(item);
        let window = session.config().batch_window;
        self.schedule_flush(session, window);
    }

    pub(crate) fn set_remote_event_types(&self, types: Vec<String>) {
        self.0.borrow_mut().remote_event_types = types.into_iter().collect();
    }

    /// Apply queued wire items, then hand every pending event to handlers.
    pub(crate) fn flush(&self, session: &mut Session) {
        let (id, inbound) = {
            let mut state = self.0.borrow_mut();
            if state.disposed {
                state.flush_scheduled = false;
                return;
            }
            (state.id.clone(), std::mem::take(&mut state.inbound))
        };

        // flush_scheduled stays set so remote sets don't schedule another flush
        for item in inbound {
            match item {
                Inbound::Prop { name, value } => {
                    if let Err(err) = self.apply_set(session, &name, value, Origin::Remote) {
                        tracing::warn!(session_id = %session.id(), mirror = %id, %err, "remote set rejected");
                    }
                },
                Inbound::Event { kind, payload } => {
                    self.0.borrow_mut().pending_events.push(MirrorEvent {
                        source: id.clone(),
                        kind,
                        origin: Origin::Remote,
                        old: Value::Null,
                        new: Value::Null,
                        payload,
                    });
                },
            }
        }

        let events = {
            let mut state = self.0.borrow_mut();
            state.flush_scheduled = false;
            std::mem::take(&mut state.pending_events)
        };
        if !events.is_empty() {
            self.dispatch(session, &events);
        }
    }

    fn dispatch(&self, session: &mut Session, events: &[MirrorEvent]) {
        let mut kinds: Vec<&str> = Vec::new();
        for event in events {
            if !kinds.contains(&event.kind.as_str()) {
                kinds.push(&event.kind);
            }
        }

        for kind in kinds {
            let batch: Vec<MirrorEvent> = events.iter().filter(|e| e.kind == kind).cloned().collect();
            let handlers: Vec<SharedHandler> = self
                .0
                .borrow()
                .handlers
                .get(kind)
                .map(|list| list.iter().map(|(_, h)| Rc::clone(h)).collect())
                .unwrap_or_default();

            for handler in handlers {
                if self.is_disposed() {
                    return;
                }
                match handler.try_borrow_mut() {
                    Ok(mut handler) => {
                        let call: &mut Handler = &mut handler;
                        call(session, self, &batch);
                    },
                    Err(_) => tracing::debug!(mirror = %self.id(), kind, "handler re-entered; skipped"),
                }
            }
        }
    }

    fn apply_set(&self, session: &mut Session, name: &str, value: Value, origin: Origin) -> Result<bool, MirrorError> {
        let (id, class) = {
            let state = self.0.borrow();
            if state.disposed {
                return Err(MirrorError::Disposed(state.id.clone()));
            }
            (state.id.clone(), state.class)
        };

        let attr = class
            .attribute(name)
            .ok_or_else(|| MirrorError::UnknownAttribute { class: class.name, name: name.to_string() })?;
        if origin == Origin::Remote && !attr.sync.is_syncable() {
            return Err(MirrorError::NotSynced(name.to_string()));
        }

        if name == PARENT_ATTRIBUTE {
            let parent = match &value {
                Value::Null => None,
                Value::String(parent_id) => Some(session.mirror(parent_id).ok_or(MirrorError::InvalidParent {
                    id,
                    reason: "unknown parent id",
                })?),
                other => {
                    return Err(MirrorError::Validation {
                        attribute: name.to_string(),
                        reason: format!("expected a mirror id or null, got {other}"),
                    });
                },
            };
            let before = self.parent();
            self.reparent(session, parent.as_ref(), origin)?;
            let after = self.parent();
            return Ok(match (before, after) {
                (Some(a), Some(b)) => !a.ptr_eq(&b),
                (None, None) => false,
                _ => true,
            });
        }
        if name == CHILDREN_ATTRIBUTE {
            return Err(MirrorError::InvalidParent { id, reason: "children follow from each child's parent" });
        }

        let normalized = attr
            .kind
            .normalize(value.clone())
            .map_err(|reason| MirrorError::Validation { attribute: name.to_string(), reason })?;
        let corrected = origin == Origin::Remote && normalized != value;
        Ok(self.write(session, attr, normalized, origin, corrected))
    }

    /// Store `value`, queue the change event and send it where the sync mode
    /// says so. `force_echo` sends a both-sides value back even when the
    /// stored value did not change (the remote holds an unnormalized one).
    fn write(&self, session: &mut Session, attr: &'static Attribute, value: Value, origin: Origin, force_echo: bool) -> bool {
        let (id, changed) = {
            let mut state = self.0.borrow_mut();
            let old = state.values.get(attr.name).cloned().unwrap_or(Value::Null);
            let changed = old != value;
            if changed {
                state.values.insert(attr.name, value.clone());
                let event = MirrorEvent {
                    source: state.id.clone(),
                    kind: attr.name.to_string(),
                    origin,
                    old,
                    new: value.clone(),
                    payload: Value::Null,
                };
                state.pending_events.push(event);
            }
            (state.id.clone(), changed)
        };

        if changed {
            self.schedule_flush(session, Duration::ZERO);
        }
        let send = match (attr.sync, origin) {
            (SyncMode::Local, _) | (SyncMode::Synced, Origin::Remote) => false,
            (SyncMode::Synced, Origin::Host) => changed,
            (SyncMode::BothSides, _) => changed || force_echo,
        };
        if send {
            session.send(Command::SetProp { id, name: attr.name.to_string(), value });
        }
        changed
    }

    fn write_tree(&self, session: &mut Session, name: &str, value: Value, origin: Origin) {
        let class = self.class();
        if let Some(attr) = class.attribute(name) {
            self.write(session, attr, value, origin, false);
        }
    }

    fn reparent(&self, session: &mut Session, parent: Option<&Self>, origin: Origin) -> Result<(), MirrorError> {
        if let Some(parent) = parent {
            parent.check_live(session)?;
            let mut ancestor = Some(parent.clone());
            while let Some(current) = ancestor {
                if current.ptr_eq(self) {
                    return Err(MirrorError::InvalidParent {
                        id: self.id(),
                        reason: "a mirror cannot be its own ancestor",
                    });
                }
                ancestor = current.parent();
            }
        }
        self.link_parent(session, parent, origin);
        Ok(())
    }

    fn link_parent(&self, session: &mut Session, parent: Option<&Self>, origin: Origin) {
        let old = self.parent();
        let unchanged = match (&old, parent) {
            (Some(old), Some(new)) => old.ptr_eq(new),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        if let Some(old) = old {
            old.0.borrow_mut().children.retain(|child| !child.ptr_eq(self));
            let ids = old.child_ids();
            old.write_tree(session, CHILDREN_ATTRIBUTE, ids, Origin::Host);
        }

        self.0.borrow_mut().parent = parent.map(Self::downgrade);
        if let Some(parent) = parent {
            parent.0.borrow_mut().children.push(self.clone());
            let ids = parent.child_ids();
            parent.write_tree(session, CHILDREN_ATTRIBUTE, ids, Origin::Host);
        }

        let parent_id = parent.map_or(Value::Null, |p| Value::String(p.id()));
        self.write_tree(session, PARENT_ATTRIBUTE, parent_id, origin);
    }

    fn child_ids(&self) -> Value {
        Value::Array(self.0.borrow().children.iter().map(|c| Value::String(c.id())).collect())
    }

    fn announce_event_types(&self, session: &mut Session) {
        let (id, types) = {
            let state = self.0.borrow();
            (state.id.clone(), state.handlers.keys().cloned().collect())
        };
        session.send(Command::SetEventTypes { id, types });
    }

    fn schedule_flush(&self, session: &mut Session, delay: Duration) {
        let id = {
            let mut state = self.0.borrow_mut();
            if state.flush_scheduled {
                return;
            }
            state.flush_scheduled = true;
            state.id.clone()
        };
        session.schedule(delay, SessionTask::Flush { id });
    }

    fn check_session(&self, session: &Session) -> Result<(), MirrorError> {
        let state = self.0.borrow();
        if state.session_id != *session.id() {
            return Err(MirrorError::WrongSession(state.id.clone()));
        }
        Ok(())
    }

    fn check_live(&self, session: &Session) -> Result<(), MirrorError> {
        self.check_session(session)?;
        if self.is_disposed() {
            return Err(MirrorError::Disposed(self.id()));
        }
        Ok(())
    }
}
