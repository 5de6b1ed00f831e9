//! Duplex channel seam.
//!
//! The core never performs I/O; drivers write encoded commands to a
//! [`Channel`] implementation supplied by the transport.

use std::io;

use tether_proto::{CloseCode, Command};

/// One duplex connection to a remote peer.
pub trait Channel {
    /// Write one encoded message.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Whether the channel has closed (from either end).
    fn is_closed(&self) -> bool;

    /// Close with a code and a human-readable reason.
    fn close(&mut self, code: CloseCode, reason: &str);

    /// Encode and write a command as one line.
    fn send_command(&mut self, command: &Command) -> io::Result<()> {
        let mut line = command.encode();
        line.push('\n');
        self.send(line.as_bytes())
    }
}

/// In-memory channel that records everything written to it.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    sent: Vec<String>,
    closed: Option<(CloseCode, String)>,
}

impl MemoryChannel {
    /// Open, empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines written so far (without the trailing newline).
    pub fn lines(&self) -> &[String] {
        &self.sent
    }

    /// Decoded commands written so far; undecodable lines are skipped.
    pub fn commands(&self) -> Vec<Command> {
        self.sent.iter().filter_map(|line| Command::decode(line).ok()).collect()
    }

    /// Close code and reason, once closed.
    pub fn close_reason(&self) -> Option<&(CloseCode, String)> {
        self.closed.as_ref()
    }
}

impl Channel for MemoryChannel {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.closed.is_some() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        let text = String::from_utf8_lossy(bytes);
        self.sent.extend(text.lines().map(str::to_string));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    fn close(&mut self, code: CloseCode, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some((code, reason.to_string()));
        }
    }
}
