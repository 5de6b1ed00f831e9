//! Mirror synchronization behavior tests
//!
//! Drives a connected session directly: inbound commands go through
//! `Session::receive`, scheduled flushes run immediately.

use std::{cell::RefCell, rc::Rc};

use serde_json::{Value, json};
use tether_core::{
    AssetStore, Attribute, Mirror, MirrorClass, MirrorError, MirrorEvent, Origin, Session, SessionAction,
    SessionConfig, SessionId, SyncMode, ValueKind,
    mirror::{CHILDREN_ATTRIBUTE, PARENT_ATTRIBUTE},
};
use tether_proto::{Command, DefineKind};

static COUNTER: MirrorClass = MirrorClass {
    name: "Counter",
    module: "demo.counter",
    base: None,
    attributes: &[
        Attribute::new("value", SyncMode::BothSides, ValueKind::Int { min: Some(0), max: Some(100) }),
        Attribute::new("label", SyncMode::Synced, ValueKind::Str),
        Attribute::new("cache", SyncMode::Local, ValueKind::Any),
    ],
    css: ".counter {}",
};

static NODE: MirrorClass = MirrorClass {
    name: "Node",
    module: "demo.tree",
    base: None,
    attributes: &[
        Attribute::new(PARENT_ATTRIBUTE, SyncMode::Synced, ValueKind::Ref),
        Attribute::new(CHILDREN_ATTRIBUTE, SyncMode::Synced, ValueKind::RefList),
    ],
    css: "",
};

fn connected(id: &str) -> Session {
    let mut session =
        Session::new(SessionId::from(id), "demo", AssetStore::new().into_shared(), SessionConfig::default());
    session.attach().unwrap();
    session.take_actions();
    session
}

/// Run every scheduled task until the session goes quiet; return what was
/// sent.
fn drain(session: &mut Session) -> Vec<Command> {
    let mut sent = Vec::new();
    loop {
        let actions = session.take_actions();
        if actions.is_empty() {
            return sent;
        }
        for action in actions {
            match action {
                SessionAction::Send(command) => sent.push(command),
                SessionAction::Schedule { task, .. } => session.run_task(task),
            }
        }
    }
}

fn counter(session: &mut Session) -> Mirror {
    let mirror = Mirror::create(session, &COUNTER, Vec::new()).unwrap();
    drain(session);
    mirror
}

fn record(session: &mut Session, mirror: &Mirror, kind: &str) -> Rc<RefCell<Vec<Vec<MirrorEvent>>>> {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&calls);
    mirror.on(session, kind, move |_, _, events| sink.borrow_mut().push(events.to_vec())).unwrap();
    drain(session);
    calls
}

fn set_prop(id: &str, name: &str, value: Value) -> Command {
    Command::SetProp { id: id.to_string(), name: name.to_string(), value }
}

#[test]
fn create_delivers_module_then_instantiates() {
    let mut session = connected("s");
    let mirror = Mirror::create(&mut session, &COUNTER, [("label", json!("hi"))]).unwrap();

    let sent = drain(&mut session);
    assert_eq!(sent.len(), 3);
    assert!(matches!(&sent[0], Command::Define { kind: DefineKind::Css, name, .. } if name == "demo.counter.css"));
    assert!(matches!(&sent[1], Command::Define { kind: DefineKind::JsEval, name, .. } if name == "demo.counter.js"));
    assert_eq!(sent[2], Command::Instantiate {
        id: "Counter_1".into(),
        class: "Counter".into(),
        props: json!({"value": 0, "label": "hi"}).as_object().cloned().unwrap(),
        event_types: Vec::new(),
    });
    assert_eq!(mirror.id(), "Counter_1");

    // Module already present: only the instance goes out
    let second = Mirror::create(&mut session, &COUNTER, Vec::new()).unwrap();
    let sent = drain(&mut session);
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], Command::Instantiate { id, .. } if id == "Counter_2"));
    assert_eq!(second.id(), "Counter_2");
}

#[test]
fn create_rejects_bad_initial_values() {
    let mut session = connected("s");
    assert!(matches!(
        Mirror::create(&mut session, &COUNTER, [("missing", json!(1))]),
        Err(MirrorError::UnknownAttribute { .. })
    ));
    assert!(matches!(
        Mirror::create(&mut session, &COUNTER, [("value", json!("x"))]),
        Err(MirrorError::Validation { .. })
    ));
    // Nothing was delivered for the failed attempts
    assert!(drain(&mut session).is_empty());
}

#[test]
fn setting_an_equal_value_is_a_no_op() {
    let mut session = connected("s");
    let mirror = counter(&mut session);
    let changes = record(&mut session, &mirror, "value");

    assert!(mirror.set(&mut session, "value", json!(5)).unwrap());
    assert_eq!(drain(&mut session), vec![set_prop("Counter_1", "value", json!(5))]);

    // 5.4 normalizes to 5: nothing happens
    assert!(!mirror.set(&mut session, "value", json!(5.4)).unwrap());
    assert!(!mirror.set(&mut session, "label", json!("")).unwrap());
    assert!(drain(&mut session).is_empty());
    assert_eq!(changes.borrow().len(), 1);
}

#[test]
fn local_attributes_never_leave_the_host() {
    let mut session = connected("s");
    let mirror = counter(&mut session);

    assert!(mirror.set(&mut session, "cache", json!({"k": 1})).unwrap());
    assert!(drain(&mut session).is_empty());
    assert_eq!(mirror.get("cache"), Some(json!({"k": 1})));

    session.receive(set_prop("Counter_1", "cache", json!(2)));
    assert!(drain(&mut session).is_empty());
    assert_eq!(mirror.get("cache"), Some(json!({"k": 1})));
}

#[test]
fn remote_set_of_synced_attribute_is_not_echoed() {
    let mut session = connected("s");
    let mirror = counter(&mut session);
    let changes = record(&mut session, &mirror, "label");

    session.receive(set_prop("Counter_1", "label", json!("from remote")));
    assert!(drain(&mut session).is_empty());

    assert_eq!(mirror.get("label"), Some(json!("from remote")));
    let calls = changes.borrow();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0].origin, Origin::Remote);
    assert_eq!(calls[0][0].new, json!("from remote"));
}

#[test]
fn both_sides_values_are_confirmed_by_the_host() {
    let mut session = connected("s");
    let mirror = counter(&mut session);

    // Out of range: clamped and sent back
    session.receive(set_prop("Counter_1", "value", json!(500)));
    assert_eq!(drain(&mut session), vec![set_prop("Counter_1", "value", json!(100))]);
    assert_eq!(mirror.get("value"), Some(json!(100)));

    // Valid change: confirmed
    session.receive(set_prop("Counter_1", "value", json!(7)));
    assert_eq!(drain(&mut session), vec![set_prop("Counter_1", "value", json!(7))]);

    // Unnormalized but equal after normalization: corrected, no change event
    session.receive(set_prop("Counter_1", "value", json!(7.9)));
    assert_eq!(drain(&mut session), vec![set_prop("Counter_1", "value", json!(7))]);

    // Exactly the current value: nothing to say
    session.receive(set_prop("Counter_1", "value", json!(7)));
    assert!(drain(&mut session).is_empty());
}

#[test]
fn events_cross_only_when_the_remote_listens() {
    let mut session = connected("s");
    let mirror = counter(&mut session);

    mirror.emit(&mut session, "click", json!({"x": 1})).unwrap();
    assert!(drain(&mut session).is_empty());

    session.receive(Command::SetEventTypes { id: "Counter_1".into(), types: vec!["click".into(), "label".into()] });
    assert_eq!(mirror.remote_event_types(), ["click", "label"]);

    mirror.emit(&mut session, "click", json!({"x": 2})).unwrap();
    assert_eq!(drain(&mut session), vec![Command::Event {
        id: "Counter_1".into(),
        kind: "click".into(),
        payload: json!({"x": 2}),
    }]);

    // Property names travel as SET_PROP, never as events
    mirror.emit(&mut session, "label", json!(null)).unwrap();
    assert!(drain(&mut session).is_empty());
}

#[test]
fn handler_registration_announces_event_types() {
    let mut session = connected("s");
    let mirror = counter(&mut session);

    let first = mirror.on(&mut session, "click", |_, _, _| {}).unwrap();
    assert_eq!(drain(&mut session), vec![Command::SetEventTypes {
        id: "Counter_1".into(),
        types: vec!["click".into()],
    }]);

    let second = mirror.on(&mut session, "click", |_, _, _| {}).unwrap();
    assert!(drain(&mut session).is_empty());

    assert!(mirror.off(&mut session, first));
    assert!(drain(&mut session).is_empty());
    assert!(mirror.off(&mut session, second));
    assert_eq!(drain(&mut session), vec![Command::SetEventTypes { id: "Counter_1".into(), types: vec![] }]);
    assert!(!mirror.off(&mut session, second));
}

#[test]
fn inbound_bursts_reach_handlers_in_one_batch() {
    let mut session = connected("s");
    let mirror = counter(&mut session);
    let labels = record(&mut session, &mirror, "label");
    let clicks = record(&mut session, &mirror, "click");

    session.receive(set_prop("Counter_1", "label", json!("a")));
    session.receive(Command::Event { id: "Counter_1".into(), kind: "click".into(), payload: json!(1) });
    session.receive(set_prop("Counter_1", "label", json!("b")));
    session.receive(Command::Event { id: "Counter_1".into(), kind: "click".into(), payload: json!(2) });

    // One flush for the whole burst, after the batch window
    let actions = session.take_actions();
    assert_eq!(actions.len(), 1);
    let SessionAction::Schedule { delay, task } = &actions[0] else {
        panic!("expected a scheduled flush, got {actions:?}");
    };
    assert_eq!(*delay, session.config().batch_window);
    assert!(labels.borrow().is_empty());

    session.run_task(task.clone());
    drain(&mut session);

    let labels = labels.borrow();
    assert_eq!(labels.len(), 1);
    let values: Vec<&Value> = labels[0].iter().map(|e| &e.new).collect();
    assert_eq!(values, [&json!("a"), &json!("b")]);

    let clicks = clicks.borrow();
    assert_eq!(clicks.len(), 1);
    let payloads: Vec<&Value> = clicks[0].iter().map(|e| &e.payload).collect();
    assert_eq!(payloads, [&json!(1), &json!(2)]);
}

#[test]
fn handlers_may_mutate_the_mirror() {
    let mut session = connected("s");
    let mirror = counter(&mut session);
    mirror
        .on(&mut session, "label", |session, mirror, events| {
            let n = events.len() as i64;
            mirror.set(session, "value", json!(n)).unwrap();
        })
        .unwrap();
    drain(&mut session);

    mirror.set(&mut session, "label", json!("x")).unwrap();
    let sent = drain(&mut session);
    assert_eq!(sent, vec![
        set_prop("Counter_1", "label", json!("x")),
        set_prop("Counter_1", "value", json!(1)),
    ]);
}

#[test]
fn parent_and_children_stay_consistent() {
    let mut session = connected("s");
    let a = Mirror::create(&mut session, &NODE, Vec::new()).unwrap();
    let b = Mirror::create(&mut session, &NODE, Vec::new()).unwrap();
    let child = Mirror::create(&mut session, &NODE, Vec::new()).unwrap();
    drain(&mut session);

    child.set_parent(&mut session, Some(&a)).unwrap();
    assert_eq!(a.get(CHILDREN_ATTRIBUTE), Some(json!([child.id()])));
    assert_eq!(child.get(PARENT_ATTRIBUTE), Some(json!(a.id())));
    assert_eq!(drain(&mut session), vec![
        set_prop(&a.id(), CHILDREN_ATTRIBUTE, json!([child.id()])),
        set_prop(&child.id(), PARENT_ATTRIBUTE, json!(a.id())),
    ]);

    child.set_parent(&mut session, Some(&b)).unwrap();
    assert_eq!(a.get(CHILDREN_ATTRIBUTE), Some(json!([])));
    assert_eq!(b.get(CHILDREN_ATTRIBUTE), Some(json!([child.id()])));
    assert!(child.parent().unwrap().ptr_eq(&b));
    assert!(a.children().is_empty());

    // No cycles, no self-parenting
    assert!(matches!(b.set_parent(&mut session, Some(&child)), Err(MirrorError::InvalidParent { .. })));
    assert!(matches!(b.set_parent(&mut session, Some(&b)), Err(MirrorError::InvalidParent { .. })));

    // Tree links go through set_parent only
    assert!(matches!(
        b.set(&mut session, CHILDREN_ATTRIBUTE, json!([])),
        Err(MirrorError::InvalidParent { .. })
    ));
}

#[test]
fn remote_parent_set_is_applied_without_echo() {
    let mut session = connected("s");
    let parent = Mirror::create(&mut session, &NODE, Vec::new()).unwrap();
    let child = Mirror::create(&mut session, &NODE, Vec::new()).unwrap();
    drain(&mut session);

    session.receive(set_prop(&child.id(), PARENT_ATTRIBUTE, json!(parent.id())));
    let sent = drain(&mut session);

    assert!(child.parent().unwrap().ptr_eq(&parent));
    // The parent's children list is host-derived and goes out; the child's
    // parent value came from the wire and does not
    assert_eq!(sent, vec![set_prop(&parent.id(), CHILDREN_ATTRIBUTE, json!([child.id()]))]);
}

#[test]
fn dispose_sends_and_silences_the_id() {
    let mut session = connected("s");
    let mirror = counter(&mut session);

    assert!(mirror.dispose(&mut session).unwrap());
    assert!(!mirror.dispose(&mut session).unwrap());
    assert_eq!(drain(&mut session), vec![Command::Dispose { id: "Counter_1".into() }]);
    assert!(session.mirror("Counter_1").is_none());

    // Straggling traffic is dropped
    session.receive(set_prop("Counter_1", "label", json!("late")));
    session.receive(Command::DisposeAck { id: "Counter_1".into() });
    assert!(drain(&mut session).is_empty());

    assert!(matches!(mirror.set(&mut session, "label", json!("x")), Err(MirrorError::Disposed(_))));
}

#[test]
fn remote_dispose_is_acknowledged() {
    let mut session = connected("s");
    let mirror = counter(&mut session);

    session.receive(Command::Dispose { id: "Counter_1".into() });
    assert_eq!(drain(&mut session), vec![Command::DisposeAck { id: "Counter_1".into() }]);
    assert!(mirror.is_disposed());
}

#[test]
fn dropped_mirrors_are_collected_on_pong() {
    let mut session = connected("s");
    let mirror = counter(&mut session);
    let kept = counter(&mut session);
    drop(mirror);

    let count = session.ping();
    session.receive(Command::Pong { count });
    assert_eq!(drain(&mut session), vec![Command::Ping { count: 1 }, Command::Dispose { id: "Counter_1".into() }]);
    assert!(session.mirror(&kept.id()).is_some());
}

#[test]
fn mirrors_are_bound_to_their_session() {
    let mut one = connected("one");
    let mut two = connected("two");
    let mirror = counter(&mut one);

    assert!(matches!(mirror.set(&mut two, "label", json!("x")), Err(MirrorError::WrongSession(_))));
    drain(&mut two);
}

#[test]
fn closing_the_session_disposes_everything() {
    let mut session = connected("s");
    let mirror = counter(&mut session);
    session.set_root(mirror.clone());
    session.keep_alive(&mirror, 10);

    session.close();
    assert!(mirror.is_disposed());
    assert_eq!(session.guarded_count(), 0);
    assert!(session.root().is_none());
    assert_eq!(session.mirror_count(), 0);
    assert!(matches!(Mirror::create(&mut session, &COUNTER, Vec::new()), Err(MirrorError::Session(_))));
}

fn remote_counter(id: &str, props: Value) -> Command {
    Command::Instantiate {
        id: id.to_string(),
        class: "Counter".into(),
        props: props.as_object().cloned().unwrap(),
        event_types: vec!["click".into()],
    }
}

fn known_counter_class(session: &Session) {
    session.store().borrow_mut().register_class(&COUNTER).unwrap();
}

#[test]
fn remote_instantiate_adopts_under_the_remote_id() {
    let mut session = connected("s");
    known_counter_class(&session);

    session.receive(remote_counter("Counter_1", json!({"value": 500, "label": "remote"})));
    // The clamped value goes back; nothing is instantiated in return
    assert_eq!(drain(&mut session), vec![set_prop("Counter_1", "value", json!(100))]);

    let mirror = session.mirror("Counter_1").unwrap();
    assert_eq!(mirror.get("label"), Some(json!("remote")));
    assert_eq!(mirror.remote_event_types(), ["click"]);
    assert_eq!(session.guarded_count(), 1);
    drop(mirror);

    // Host-allocated ids skip the remote's
    let local = counter(&mut session);
    assert_eq!(local.id(), "Counter_2");

    // One round trip later nothing holds the adopted mirror
    let count = session.ping();
    session.receive(Command::Pong { count });
    assert_eq!(drain(&mut session), vec![Command::Ping { count: 1 }, Command::Dispose { id: "Counter_1".into() }]);
    assert_eq!(session.guarded_count(), 0);
}

#[test]
fn remote_instantiate_of_a_live_id_only_keeps_it_alive() {
    let mut session = connected("s");
    let mirror = counter(&mut session);

    session.receive(remote_counter("Counter_1", json!({"label": "ignored"})));
    assert!(drain(&mut session).is_empty());
    assert_eq!(mirror.get("label"), Some(json!("")));
    assert_eq!(session.guarded_count(), 1);
}

#[test]
fn remote_instantiate_of_an_unknown_class_is_dropped() {
    let mut session = connected("s");

    session.receive(remote_counter("Counter_1", json!({})));
    assert!(drain(&mut session).is_empty());
    assert!(session.mirror("Counter_1").is_none());

    // Local attributes cannot be set from the remote
    known_counter_class(&session);
    session.receive(remote_counter("Counter_1", json!({"cache": 1})));
    assert!(drain(&mut session).is_empty());
    assert!(session.mirror("Counter_1").is_none());
    assert_eq!(session.guarded_count(), 0);
}

#[test]
fn invoke_runs_the_registered_action() {
    let mut session = connected("s");
    let mirror = counter(&mut session);
    let calls = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&calls);
    mirror
        .action(&session, "bump", move |session, mirror, args| {
            sink.borrow_mut().push(args.to_vec());
            mirror.set(session, "value", args[0].clone()).unwrap();
        })
        .unwrap();

    session.receive(Command::Invoke { id: "Counter_1".into(), action: "bump".into(), args: vec![json!(9), json!("x")] });
    assert_eq!(*calls.borrow(), vec![vec![json!(9), json!("x")]]);
    assert_eq!(drain(&mut session), vec![set_prop("Counter_1", "value", json!(9))]);

    // Unknown actions and ids are ignored
    session.receive(Command::Invoke { id: "Counter_1".into(), action: "missing".into(), args: Vec::new() });
    session.receive(Command::Invoke { id: "Counter_9".into(), action: "bump".into(), args: vec![json!(1)] });
    assert!(drain(&mut session).is_empty());
    assert_eq!(calls.borrow().len(), 1);
}

#[test]
fn invoke_after_dispose_does_nothing() {
    let mut session = connected("s");
    let mirror = counter(&mut session);
    let ran = Rc::new(RefCell::new(0));
    let count = Rc::clone(&ran);
    mirror.action(&session, "bump", move |_, _, _| *count.borrow_mut() += 1).unwrap();

    mirror.dispose(&mut session).unwrap();
    drain(&mut session);
    session.receive(Command::Invoke { id: "Counter_1".into(), action: "bump".into(), args: Vec::new() });
    assert!(drain(&mut session).is_empty());
    assert_eq!(*ran.borrow(), 0);
    assert!(matches!(mirror.action(&session, "bump", |_, _, _| {}), Err(MirrorError::Disposed(_))));
}
