//! Tokio TCP transport.
//!
//! Newline-delimited command lines over plain TCP. Each accepted stream gets
//! a reader task and a writer task; neither touches session state. The
//! reader marshals lines into the event loop through an unbounded mpsc
//! sender, and the writer drains a per-channel outbound queue.
//!
//! ```text
//! socket ──reader task──> ServerEvent mpsc ──> event loop (driver)
//! socket <──writer task── Outbound mpsc    <── TcpChannel::send
//! ```

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tether_core::Channel;
use tether_proto::{CloseCode, Command, MAX_LINE_LEN};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::AbortHandle,
};

use crate::{driver::ServerEvent, error::ServerError};

/// TCP listener handing out [`TcpChannel`]s.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind to `address` (e.g. `"127.0.0.1:7070"`).
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;

        tracing::info!("TCP transport bound to {}", addr);
        Ok(Self { listener })
    }

    /// Accept the next stream.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        self.listener.accept().await.map_err(|e| ServerError::Transport(format!("accept failed: {e}")))
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

/// Work queued for a channel's writer task.
#[derive(Debug)]
enum Outbound {
    Line(Vec<u8>),
    Close { code: CloseCode, reason: String },
}

/// Write side of an accepted TCP stream.
///
/// Sends never block the event loop: bytes are queued for the writer task.
/// A send after the writer has gone reports `BrokenPipe`.
#[derive(Debug)]
pub struct TcpChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
    reader: AbortHandle,
}

impl Channel for TcpChannel {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        self.outbound
            .send(Outbound::Line(bytes.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer task gone"))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbound.is_closed()
    }

    fn close(&mut self, code: CloseCode, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Writer may already be gone; nothing left to tell the peer then
        let _ = self.outbound.send(Outbound::Close { code, reason: reason.to_string() });
        self.reader.abort();
    }
}

/// Start the reader and writer tasks for `stream`.
///
/// The reader posts `LineReceived` for every line and a final
/// `ChannelClosed` on EOF or error. Oversized and non-UTF-8 lines are
/// dropped with a warning.
pub fn spawn_channel(
    channel_id: u64,
    stream: TcpStream,
    events: mpsc::UnboundedSender<ServerEvent>,
) -> TcpChannel {
    let (read_half, write_half) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    tokio::spawn(write_loop(channel_id, write_half, outbound_rx, Arc::clone(&closed)));
    let reader = tokio::spawn(read_loop(channel_id, read_half, events)).abort_handle();

    TcpChannel { outbound, closed, reader }
}

async fn read_loop(channel_id: u64, read_half: OwnedReadHalf, events: mpsc::UnboundedSender<ServerEvent>) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    let limit = (MAX_LINE_LEN + 1) as u64;

    let reason = loop {
        buf.clear();
        match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
            Ok(0) => break "peer closed".to_string(),
            Ok(_) => {},
            Err(e) => break format!("read error: {e}"),
        }

        if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LEN {
            tracing::warn!(channel_id, "line exceeds {} bytes, dropped", MAX_LINE_LEN);
            if let Err(e) = skip_line(&mut reader).await {
                break format!("read error: {e}");
            }
            continue;
        }

        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        if buf.is_empty() {
            continue;
        }

        match String::from_utf8(std::mem::take(&mut buf)) {
            Ok(line) => {
                if events.send(ServerEvent::LineReceived { channel_id, line }).is_err() {
                    return;
                }
            },
            Err(_) => tracing::warn!(channel_id, "line is not UTF-8, dropped"),
        }
    };

    tracing::debug!(channel_id, %reason, "reader finished");
    let _ = events.send(ServerEvent::ChannelClosed { channel_id, reason });
}

/// Discard input up to and including the next newline.
async fn skip_line(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<()> {
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        match chunk.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            },
            None => {
                let len = chunk.len();
                reader.consume(len);
            },
        }
    }
}

async fn write_loop(
    channel_id: u64,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    closed: Arc<AtomicBool>,
) {
    while let Some(item) = outbound.recv().await {
        let result = match item {
            Outbound::Line(bytes) => write_half.write_all(&bytes).await,
            Outbound::Close { code, reason } => {
                let mut line = Command::Close { code: code.to_u16(), reason }.encode();
                line.push('\n');
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    tracing::debug!(channel_id, error = %e, "CLOSE not delivered");
                }
                break;
            },
        };
        if let Err(e) = result {
            tracing::debug!(channel_id, error = %e, "write failed");
            break;
        }
    }

    closed.store(true, Ordering::Release);
    let _ = write_half.shutdown().await;
}
