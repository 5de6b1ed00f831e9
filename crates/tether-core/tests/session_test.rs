//! Session behavior tests
//!
//! Covers the pending queue, class delivery through a shared asset store,
//! and the per-session delivery bookkeeping.

use bytes::Bytes;
use tether_core::{
    AssetSource, AssetStore, Attribute, Mirror, MirrorClass, Module, Session, SessionAction, SessionConfig,
    SessionError, SessionId, SessionStatus, SharedStore, SyncMode, ValueKind,
};
use tether_proto::{Command, DefineKind};

static WIDGET: MirrorClass = MirrorClass {
    name: "Widget",
    module: "ui.base",
    base: None,
    attributes: &[Attribute::new("title", SyncMode::Synced, ValueKind::Str)],
    css: ".widget { margin: 0 }",
};

static BUTTON: MirrorClass = MirrorClass {
    name: "Button",
    module: "ui.button",
    base: Some(&WIDGET),
    attributes: &[Attribute::new("pressed", SyncMode::BothSides, ValueKind::Bool)],
    css: "",
};

static PANEL: MirrorClass = MirrorClass {
    name: "Panel",
    module: "ui.base",
    base: Some(&WIDGET),
    attributes: &[],
    css: "",
};

fn store() -> SharedStore {
    let mut store = AssetStore::new();
    store.add_module(Module::new("ui.base").unwrap()).unwrap();
    store
        .associate_asset("ui.base", "icons.png", Some(AssetSource::Literal(Bytes::from_static(b"\x89PNG"))))
        .unwrap();
    store.into_shared()
}

fn session(id: &str, store: &SharedStore) -> Session {
    Session::new(SessionId::from(id), "demo", std::rc::Rc::clone(store), SessionConfig::default())
}

fn sent(session: &mut Session) -> Vec<Command> {
    session
        .take_actions()
        .into_iter()
        .filter_map(|action| match action {
            SessionAction::Send(command) => Some(command),
            _ => None,
        })
        .collect()
}

fn define_names(commands: &[Command]) -> Vec<(DefineKind, String)> {
    commands
        .iter()
        .filter_map(|command| match command {
            Command::Define { kind, name, .. } => Some((*kind, name.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn pending_session_delivers_everything_on_attach() {
    let store = store();
    let mut session = session("pending", &store);

    let button = Mirror::create(&mut session, &BUTTON, Vec::new()).unwrap();
    assert!(session.take_actions().is_empty());
    assert_eq!(session.queued(), 5);

    session.attach().unwrap();
    let commands = sent(&mut session);

    assert_eq!(define_names(&commands), [
        (DefineKind::Data, "icons.png".to_string()),
        (DefineKind::Css, "ui.base.css".to_string()),
        (DefineKind::JsEval, "ui.base.js".to_string()),
        (DefineKind::JsEval, "ui.button.js".to_string()),
    ]);
    assert!(matches!(&commands[0], Command::Define { source, .. } if source == "iVBORw=="));
    assert!(matches!(&commands[4], Command::Instantiate { id, .. } if *id == button.id()));
    assert_eq!(commands[5], Command::InitDone);
    assert_eq!(commands.len(), 6);
}

#[test]
fn dependent_module_names_its_dependency() {
    let store = store();
    let mut session = session("deps", &store);
    session.attach().unwrap();
    session.take_actions();

    session.register_class(&BUTTON).unwrap();
    let commands = sent(&mut session);
    let Some(Command::Define { source, .. }) = commands.last() else {
        panic!("expected module code last, got {commands:?}");
    };
    assert!(source.starts_with("tether.define(\"ui.button\", [\"ui.base\"], function (require) {"));
    assert!(source.contains("return {Button};"));

    // Already present: nothing to send
    session.register_class(&BUTTON).unwrap();
    assert!(sent(&mut session).is_empty());
}

#[test]
fn every_session_gets_its_own_delivery() {
    let store = store();
    let mut first = session("one", &store);
    let mut second = session("two", &store);
    first.attach().unwrap();
    second.attach().unwrap();
    first.take_actions();
    second.take_actions();

    first.register_class(&WIDGET).unwrap();
    second.register_class(&WIDGET).unwrap();
    assert_eq!(define_names(&sent(&mut first)), define_names(&sent(&mut second)));
    assert!(second.present_modules().contains("ui.base"));
}

#[test]
fn module_gaining_a_class_is_redefined() {
    let store = store();
    let mut session = session("redefine", &store);
    session.attach().unwrap();
    session.take_actions();

    session.register_class(&WIDGET).unwrap();
    sent(&mut session);

    session.register_class(&PANEL).unwrap();
    let commands = sent(&mut session);
    // Assets were delivered already; the module goes out again with both classes
    assert_eq!(define_names(&commands), [
        (DefineKind::Css, "ui.base.css".to_string()),
        (DefineKind::JsEval, "ui.base.js".to_string()),
    ]);
    let Some(Command::Define { source, .. }) = commands.last() else {
        panic!("expected module code, got {commands:?}");
    };
    assert!(source.contains("return {Widget, Panel};"));
}

#[test]
fn ignored_assets_are_never_sent() {
    let store = store();
    let mut session = session("ignore", &store);
    session.attach().unwrap();
    session.take_actions();
    session.ignore_asset("icons.png");

    session.register_class(&WIDGET).unwrap();
    let names = define_names(&sent(&mut session));
    assert!(names.iter().all(|(_, name)| name != "icons.png"));
    assert_eq!(names.len(), 2);
}

#[test]
fn failed_delivery_sends_nothing() {
    let mut store = AssetStore::new();
    store.add_module(Module::new("ui.base").unwrap()).unwrap();
    store.associate_asset("ui.base", "remote.css", Some(AssetSource::Remote("https://cdn.invalid/x.css".into()))).unwrap();
    let store = store.into_shared();

    let mut session = session("fail", &store);
    session.attach().unwrap();
    session.take_actions();

    assert!(matches!(session.register_class(&WIDGET), Err(SessionError::Asset(_))));
    assert!(sent(&mut session).is_empty());
    assert!(session.present_modules().is_empty());
}

#[test]
fn closed_session_rejects_work() {
    let store = store();
    let mut session = session("closed", &store);
    session.close();

    assert_eq!(session.status(), SessionStatus::Closed);
    session.exec("ignored()");
    assert!(session.take_actions().is_empty());
    assert_eq!(session.queued(), 0);
    assert!(Mirror::create(&mut session, &WIDGET, Vec::new()).is_err());
}
