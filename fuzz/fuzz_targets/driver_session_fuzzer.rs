//! Fuzz target for the server driver
//!
//! Drives a `SimServer` with arbitrary connects, handshakes, raw lines, clock
//! advances and disconnects. The driver must never panic and must never
//! report more connected sessions than there are bound channels.

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether_core::AssetStore;
use tether_harness::SimServer;
use tether_proto::Command;
use tether_server::{DriverConfig, MONITOR_APP_NAME, MonitorApp};

#[derive(Debug, Arbitrary)]
enum Op {
    Connect,
    Hello { channel: u8, upper_case: bool },
    Attach { channel: u8, from: u8 },
    Pong { channel: u8, count: u16 },
    Line { channel: u8, line: String },
    Advance { millis: u16 },
    Tick,
    Disconnect { channel: u8 },
}

#[derive(Debug, Arbitrary)]
struct Scenario {
    ops: Vec<Op>,
}

fuzz_target!(|scenario: Scenario| {
    let mut server = SimServer::new(AssetStore::new().into_shared(), DriverConfig::default());
    if server.driver_mut().register_app(MONITOR_APP_NAME, MonitorApp::new("fuzz")).is_err() {
        return;
    }
    let mut channels: Vec<u64> = Vec::new();
    let pick = |channels: &[u64], index: u8| channels.get(usize::from(index) % channels.len().max(1)).copied();

    for op in scenario.ops.into_iter().take(256) {
        match op {
            Op::Connect => channels.push(server.connect()),
            Op::Hello { channel, upper_case } => {
                if let Some(channel) = pick(&channels, channel) {
                    let app = if upper_case { MONITOR_APP_NAME.to_uppercase() } else { MONITOR_APP_NAME.to_string() };
                    server.send(channel, &Command::Hello { app, session_id: None });
                }
            },
            Op::Attach { channel, from } => {
                let id = pick(&channels, from).and_then(|from| server.session_id(from));
                if let (Some(channel), Some(id)) = (pick(&channels, channel), id) {
                    let hello = Command::Hello { app: MONITOR_APP_NAME.to_string(), session_id: Some(id.to_string()) };
                    server.send(channel, &hello);
                }
            },
            Op::Pong { channel, count } => {
                if let Some(channel) = pick(&channels, channel) {
                    server.send(channel, &Command::Pong { count: u64::from(count) });
                }
            },
            Op::Line { channel, line } => {
                if let Some(channel) = pick(&channels, channel) {
                    server.send_line(channel, &line);
                }
            },
            Op::Advance { millis } => server.advance(Duration::from_millis(u64::from(millis) * 10)),
            Op::Tick => server.tick(),
            Op::Disconnect { channel } => {
                if let Some(channel) = pick(&channels, channel) {
                    server.disconnect(channel, "fuzz");
                }
            },
        }

        let bound = channels.iter().filter(|&&channel| server.session_id(channel).is_some()).count();
        let connected = server.driver().manager().connections(MONITOR_APP_NAME).len();
        assert!(connected <= bound, "{connected} connected sessions but {bound} bound channels");
    }
});
