//! Driver scenarios under simulation: the HELLO handshake, heartbeat
//! liveness, reaping, and channel teardown.

use std::{
    cell::{Cell, RefCell},
    io,
    rc::Rc,
    time::Duration,
};

use serde_json::json;
use tether_core::{
    AssetStore, ConnectionConfig, ConnectionState, RuntimeHandle, RuntimeLauncher, SessionId, SessionTask,
    default_store,
};
use tether_harness::{RemotePeer, SimEnv, SimServer};
use tether_proto::{CloseCode, Command};
use tether_server::{
    DriverConfig, DriverError, LogLevel, MONITOR_APP_NAME, MonitorApp, ServerAction, ServerDriver, ServerEvent,
};

const HEARTBEAT: Duration = Duration::from_secs(4);

/// Records launch URLs and whether the launched runtime was terminated.
#[derive(Default)]
struct FakeLauncher {
    urls: RefCell<Vec<String>>,
    terminated: Rc<Cell<bool>>,
    fail: bool,
}

struct FakeRuntime(Rc<Cell<bool>>);

impl RuntimeHandle for FakeRuntime {
    fn close(&mut self) {
        self.0.set(true);
    }
}

impl RuntimeLauncher for FakeLauncher {
    fn launch(&self, url: &str, _id: &SessionId) -> io::Result<Box<dyn RuntimeHandle>> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no runtime installed"));
        }
        self.urls.borrow_mut().push(url.to_string());
        Ok(Box::new(FakeRuntime(Rc::clone(&self.terminated))))
    }
}

fn server_with(config: DriverConfig) -> SimServer {
    let mut server = SimServer::new(AssetStore::new().into_shared(), config);
    server.driver_mut().register_app(MONITOR_APP_NAME, MonitorApp::new("ops")).unwrap();
    server
}

fn server() -> SimServer {
    server_with(DriverConfig::default())
}

/// Open a channel, say HELLO for a fresh monitor session, and settle.
fn attach_monitor(server: &mut SimServer, peer: &mut RemotePeer) -> u64 {
    let channel = server.connect();
    server.send(channel, &RemotePeer::hello(MONITOR_APP_NAME, None));
    server.exchange(channel, peer);
    channel
}

fn close_code(server: &SimServer, channel: u64) -> Option<CloseCode> {
    server.close_reason(channel).map(|(code, _)| *code)
}

fn logged(server: &SimServer, level: LogLevel, needle: &str) -> bool {
    server.logs().iter().any(|(l, message)| *l == level && message.contains(needle))
}

#[test]
fn hello_without_id_creates_and_attaches_a_session() {
    let mut server = server();
    let mut peer = RemotePeer::new();
    let channel = attach_monitor(&mut server, &mut peer);

    assert!(server.is_open(channel));
    assert_eq!(server.driver().channel_state(channel), Some(ConnectionState::Attached));
    assert!(peer.is_initialized());
    assert_eq!(peer.defined_names(), vec!["tether.monitor.css", "tether.monitor.js"]);
    assert_eq!(peer.prop("Monitor_1", "title"), Some(&json!("ops")));
    assert_eq!(peer.prop("Monitor_1", "connections"), Some(&json!(1)));

    let session_id = server.session_id(channel).unwrap();
    assert_eq!(server.driver().channel_for(&session_id), Some(channel));
    assert!(server.errors().is_empty());
}

#[test]
fn hello_with_pending_id_flushes_queue_before_init_done() {
    let mut server = server();
    let session_id = server.driver_mut().create_session(MONITOR_APP_NAME).unwrap();
    server.flush();

    let channel = server.connect();
    server.send(channel, &RemotePeer::hello(MONITOR_APP_NAME, Some(session_id.as_str())));
    let outbox = server.take_outbox(channel);

    let init_done = outbox.iter().position(|c| *c == Command::InitDone).unwrap();
    let instantiate = outbox.iter().position(|c| matches!(c, Command::Instantiate { .. })).unwrap();
    let last_define = outbox.iter().rposition(|c| matches!(c, Command::Define { .. })).unwrap();
    assert!(last_define < instantiate);
    assert!(instantiate < init_done);
    assert!(outbox[init_done + 1..].iter().all(|c| matches!(c, Command::SetProp { .. })));
    assert_eq!(server.session_id(channel), Some(session_id));
}

#[test]
fn app_name_in_hello_is_case_insensitive() {
    let mut server = server();
    let channel = server.connect();
    server.send(channel, &RemotePeer::hello("Monitor", None));

    assert!(server.is_open(channel));
    assert_eq!(server.driver().manager().connections(MONITOR_APP_NAME).len(), 1);
}

#[test]
fn unknown_app_is_refused() {
    let mut server = server();
    let mut peer = RemotePeer::new();
    let channel = server.connect();
    server.send(channel, &RemotePeer::hello("nonexistent", None));
    server.exchange(channel, &mut peer);

    assert_eq!(
        server.close_reason(channel),
        Some(&(CloseCode::Unacceptable, "could not associate channel with an app".to_string()))
    );
    assert_eq!(peer.close_reason().map(|(code, _)| *code), Some(1003));
    assert_eq!(server.driver().channel_count(), 0);
    assert_eq!(server.driver().manager().session_count(), 0);
}

#[test]
fn unknown_session_id_is_refused() {
    let mut server = server();
    let channel = server.connect();
    server.send(channel, &RemotePeer::hello(MONITOR_APP_NAME, Some("doesnotexist")));

    let (code, reason) = server.close_reason(channel).unwrap();
    assert_eq!(*code, CloseCode::Unacceptable);
    assert!(reason.starts_with("could not attach session:"), "{reason}");
}

#[test]
fn second_attach_to_same_session_is_refused() {
    let mut server = server();
    let session_id = server.driver_mut().create_session(MONITOR_APP_NAME).unwrap();

    let first = server.connect();
    let second = server.connect();
    server.send(first, &RemotePeer::hello(MONITOR_APP_NAME, Some(session_id.as_str())));
    server.send(second, &RemotePeer::hello(MONITOR_APP_NAME, Some(session_id.as_str())));

    assert!(server.is_open(first));
    assert_eq!(close_code(&server, second), Some(CloseCode::Unacceptable));
    assert_eq!(server.driver().channel_for(&session_id), Some(first));
}

#[test]
fn first_command_must_be_hello() {
    let mut server = server();
    let channel = server.connect();
    server.send(channel, &Command::Ping { count: 1 });

    assert_eq!(
        server.close_reason(channel),
        Some(&(CloseCode::ProtocolError, "expected HELLO, got PING".to_string()))
    );
}

#[test]
fn malformed_first_line_is_a_protocol_error() {
    let mut server = server();
    let channel = server.connect();
    server.send_line(channel, "{not json");

    let (code, reason) = server.close_reason(channel).unwrap();
    assert_eq!(*code, CloseCode::ProtocolError);
    assert!(reason.starts_with("expected HELLO"), "{reason}");
}

#[test]
fn bad_lines_after_attach_are_dropped_not_fatal() {
    let mut server = server();
    let mut peer = RemotePeer::new();
    let channel = attach_monitor(&mut server, &mut peer);

    server.send_line(channel, "[]");
    server.send_line(channel, "not even json");
    server.send(channel, &RemotePeer::hello(MONITOR_APP_NAME, None));
    server.send(channel, &Command::Unknown { verb: "FROBNICATE".to_string(), args: vec![json!(1)] });

    assert!(server.is_open(channel));
    assert!(logged(&server, LogLevel::Warn, "malformed line"));
    assert!(logged(&server, LogLevel::Warn, "sent HELLO twice"));
    assert_eq!(server.driver().manager().session_count(), 1);
}

#[test]
fn responsive_peer_survives_heartbeats() {
    let mut server = server();
    let mut peer = RemotePeer::new();
    let channel = attach_monitor(&mut server, &mut peer);
    let session_id = server.session_id(channel).unwrap();

    for _ in 0..10 {
        server.advance(HEARTBEAT);
        server.tick();
        server.exchange(channel, &mut peer);
    }

    assert!(server.is_open(channel));
    assert_eq!(peer.last_ping(), Some(10));
    let session = server.driver().manager().session(&session_id).unwrap();
    assert_eq!(session.ping_counter(), 10);
}

#[test]
fn unresponsive_peer_is_closed_after_missed_pongs() {
    let mut server = server();
    let mut peer = RemotePeer::new().unresponsive();
    let channel = attach_monitor(&mut server, &mut peer);
    let session_id = server.session_id(channel).unwrap();

    for _ in 0..5 {
        server.advance(HEARTBEAT);
        server.tick();
        server.exchange(channel, &mut peer);
        assert!(server.is_open(channel));
    }

    server.advance(HEARTBEAT);
    server.tick();
    assert_eq!(close_code(&server, channel), Some(CloseCode::GoingAway));
    assert!(server.driver().manager().session(&session_id).is_none());
}

#[test]
fn round_trip_completes_on_next_pong() {
    let mut server = server();
    let mut peer = RemotePeer::new();
    let channel = attach_monitor(&mut server, &mut peer);
    let session_id = server.session_id(channel).unwrap();

    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    let session = server.driver_mut().manager_mut().session_mut(&session_id).unwrap();
    session.call_after_roundtrip(move |session| {
        flag.set(true);
        session.exec("settled()");
    });
    server.flush();
    assert!(!ran.get());

    server.advance(HEARTBEAT);
    server.tick();
    server.exchange(channel, &mut peer);

    assert!(ran.get());
    assert_eq!(peer.execs().last().map(String::as_str), Some("settled()"));
}

#[test]
fn eval_result_reaches_its_callback() {
    let mut server = server();
    let mut peer = RemotePeer::new().answering_evals_with(json!("ops"));
    let channel = attach_monitor(&mut server, &mut peer);
    let session_id = server.session_id(channel).unwrap();

    let result = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&result);
    let session = server.driver_mut().manager_mut().session_mut(&session_id).unwrap();
    session.eval("document.title", move |_, value| *sink.borrow_mut() = Some(value));
    server.flush();
    server.exchange(channel, &mut peer);

    assert_eq!(peer.evals(), ["document.title"]);
    assert_eq!(*result.borrow(), Some(json!("ops")));
    assert_eq!(server.driver().manager().session(&session_id).unwrap().pending_evals(), 0);
}

#[test]
fn closing_a_session_directly_closes_its_channel() {
    let mut server = server();
    let mut peer = RemotePeer::new();
    let channel = attach_monitor(&mut server, &mut peer);
    let session_id = server.session_id(channel).unwrap();

    server.driver_mut().manager_mut().session_mut(&session_id).unwrap().close();
    server.flush();

    assert_eq!(server.close_reason(channel), Some(&(CloseCode::Normal, "session closed".to_string())));
    assert!(!server.is_open(channel));
    assert!(server.driver().manager().session(&session_id).is_none());
    assert!(server.driver().manager().connections(MONITOR_APP_NAME).is_empty());
    assert_eq!(server.driver().channel_for(&session_id), None);
    assert_eq!(server.driver().channel_count(), 0);

    // The runtime learns about it through CLOSE, then drops the channel
    server.exchange(channel, &mut peer);
    assert_eq!(peer.close_reason().map(|(code, _)| *code), Some(1000));
    server.disconnect(channel, "closed by host");
    assert!(server.errors().is_empty());
}

#[test]
fn manager_close_updates_remaining_monitors() {
    let mut server = server();
    let mut first_peer = RemotePeer::new();
    let mut second_peer = RemotePeer::new();
    let first = attach_monitor(&mut server, &mut first_peer);
    let second = attach_monitor(&mut server, &mut second_peer);
    server.exchange(first, &mut first_peer);
    assert_eq!(first_peer.prop("Monitor_1", "connections"), Some(&json!(2)));

    let gone = server.session_id(second).unwrap();
    assert!(server.driver_mut().manager_mut().close_session(&gone));
    server.flush();
    server.exchange(first, &mut first_peer);

    assert_eq!(server.close_reason(second), Some(&(CloseCode::Normal, "session closed".to_string())));
    assert_eq!(server.driver().channel_for(&gone), None);
    assert!(server.is_open(first));
    assert_eq!(first_peer.prop("Monitor_1", "connections"), Some(&json!(1)));
}

#[test]
fn silent_channel_times_out_waiting_for_hello() {
    let mut server = server();
    let channel = server.connect();

    server.advance(Duration::from_secs(30));
    server.tick();
    assert!(server.is_open(channel));

    server.advance(Duration::from_secs(1));
    server.tick();
    assert_eq!(close_code(&server, channel), Some(CloseCode::Unacceptable));
}

#[test]
fn hello_timeout_follows_config() {
    let config = DriverConfig {
        connection: ConnectionConfig { hello_timeout: Duration::from_secs(2), ..ConnectionConfig::default() },
        ..DriverConfig::default()
    };
    let mut server = server_with(config);
    let channel = server.connect();

    server.advance(Duration::from_secs(3));
    server.tick();
    assert!(!server.is_open(channel));
}

#[test]
fn pending_session_is_reaped_on_tick() {
    let mut server = server();
    let session_id = server.driver_mut().create_session(MONITOR_APP_NAME).unwrap();

    server.advance(Duration::from_secs(31));
    server.tick();
    assert!(server.driver().manager().session(&session_id).is_none());
    assert!(logged(&server, LogLevel::Info, "reaped"));

    let channel = server.connect();
    server.send(channel, &RemotePeer::hello(MONITOR_APP_NAME, Some(session_id.as_str())));
    assert_eq!(close_code(&server, channel), Some(CloseCode::Unacceptable));
}

#[test]
fn channels_over_capacity_are_refused() {
    let mut server = server_with(DriverConfig { max_connections: 1, ..DriverConfig::default() });
    let first = server.connect();
    let second = server.connect();

    assert!(server.is_open(first));
    assert_eq!(
        server.close_reason(second),
        Some(&(CloseCode::GoingAway, "max connections exceeded".to_string()))
    );
    assert_eq!(server.driver().channel_count(), 1);
}

#[test]
fn disconnect_closes_session_and_updates_monitors() {
    let mut server = server();
    let mut first_peer = RemotePeer::new();
    let mut second_peer = RemotePeer::new();
    let first = attach_monitor(&mut server, &mut first_peer);
    let second = attach_monitor(&mut server, &mut second_peer);
    server.exchange(first, &mut first_peer);
    assert_eq!(first_peer.prop("Monitor_1", "connections"), Some(&json!(2)));

    let gone = server.session_id(second).unwrap();
    server.disconnect(second, "peer went away");
    server.exchange(first, &mut first_peer);

    assert!(server.driver().manager().session(&gone).is_none());
    assert_eq!(server.driver().channel_for(&gone), None);
    assert_eq!(first_peer.prop("Monitor_1", "connections"), Some(&json!(1)));

    // A late close for the same channel is a no-op
    server.disconnect(second, "again");
    assert!(server.errors().is_empty());
}

#[test]
fn late_task_for_closed_session_is_dropped() {
    let mut server = server();
    let mut peer = RemotePeer::new();
    let channel = attach_monitor(&mut server, &mut peer);
    let session_id = server.session_id(channel).unwrap();

    let set = peer.set("Monitor_1", "title", json!("renamed"));
    server.send(channel, &set);
    assert_eq!(server.pending_timers(), 1);

    server.disconnect(channel, "gone");
    server.settle();
    assert!(server.errors().is_empty());
    assert!(logged(&server, LogLevel::Debug, &format!("task for closed session {session_id} dropped")));
}

#[test]
fn lines_for_unknown_channels_are_errors() {
    let mut server = server();
    server.send_line(42, "[\"PING\",1]");
    assert_eq!(server.errors().len(), 1);
}

#[test]
fn duplicate_channel_ids_are_rejected() {
    let mut driver = ServerDriver::new(SimEnv::with_seed(1), default_store(), DriverConfig::default());
    driver.process_event(ServerEvent::ChannelOpened { channel_id: 1 }).unwrap();

    let err = driver.process_event(ServerEvent::ChannelOpened { channel_id: 1 }).unwrap_err();
    assert!(matches!(err, DriverError::ChannelAlreadyExists(1)));
    assert!(!err.is_transient());

    let err = driver.process_event(ServerEvent::LineReceived { channel_id: 9, line: String::new() }).unwrap_err();
    assert!(err.is_transient());
}

#[test]
fn task_for_unknown_session_is_logged() {
    let mut driver = ServerDriver::new(SimEnv::with_seed(2), default_store(), DriverConfig::default());
    let actions = driver
        .process_event(ServerEvent::TaskDue {
            session_id: "gone".into(),
            task: SessionTask::Flush { id: "Monitor_1".to_string() },
        })
        .unwrap();

    assert!(matches!(&actions[..], [ServerAction::Log { level: LogLevel::Debug, .. }]));
}

#[test]
fn launched_runtime_attaches_and_is_terminated_with_its_channel() {
    let mut server = server();
    let launcher = FakeLauncher::default();
    let session_id = server.driver_mut().launch(MONITOR_APP_NAME, &launcher, "http://127.0.0.1:7070/").unwrap();

    assert_eq!(*launcher.urls.borrow(), vec![format!("http://127.0.0.1:7070/monitor/?session_id={session_id}")]);

    let mut peer = RemotePeer::new();
    let channel = server.connect();
    server.send(channel, &RemotePeer::hello(MONITOR_APP_NAME, Some(session_id.as_str())));
    server.exchange(channel, &mut peer);
    assert!(peer.is_initialized());
    assert!(!launcher.terminated.get());

    server.disconnect(channel, "window closed");
    assert!(launcher.terminated.get());
}

#[test]
fn failed_launch_leaves_no_session() {
    let mut server = server();
    let launcher = FakeLauncher { fail: true, ..FakeLauncher::default() };

    let err = server.driver_mut().launch(MONITOR_APP_NAME, &launcher, "http://localhost").unwrap_err();
    assert!(matches!(err, DriverError::Launch(_)));
    assert_eq!(server.driver().manager().session_count(), 0);
}
