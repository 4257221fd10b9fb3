//! Client session for individual relay connections.
//!
//! Each accepted connection gets two tasks:
//! - the `ClientSession` read loop, which decodes frames and dispatches
//!   commands to the registry and broadcast engine
//! - a writer task that drains the session's outbound queue to the socket
//!
//! Other components only ever hold a [`SessionHandle`]: a cheap-to-clone
//! handle that can queue a line or force a disconnect.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Transport errors end the session; they are never propagated
//! - Protocol errors are logged and the connection stays open

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use disucord_protocol::{CodecError, Command, FrameCodec, FrameError};

use crate::broadcast::BroadcastEngine;
use crate::registry::Registry;

/// Alias used as the author of server status notices.
pub const SERVER_ALIAS: &str = "Server";

/// Notice sent after a successful `SETNAME`.
pub const NOTICE_CONNECTED: &str = "Connected successfully.";

/// Notice sent before closing a connection whose name is taken.
pub const NOTICE_NAME_TAKEN: &str = "Username already taken.";

/// Notice sent when a named session tries to rename itself.
pub const NOTICE_NAME_ALREADY_SET: &str = "Name already set.";

/// Notice sent for a blank `SETNAME`.
pub const NOTICE_NAME_EMPTY: &str = "Username cannot be empty.";

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for flushing queued lines and closing the socket once a session
/// is told to stop. Must stay below the server's shutdown timeout.
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Unique identifier of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Formats a status notice the way every client expects it.
pub fn format_notice(text: &str) -> String {
    format!("[{SERVER_ALIAS}]: {text}")
}

// ============================================================================
// Session Handle
// ============================================================================

/// Shared handle to a live session.
///
/// Held by the registry and the lifecycle controller. Sending only queues
/// the line; the session's writer task performs the actual I/O.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    stopped: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Creates a handle and the receiving end of its outbound queue.
    ///
    /// Cancelling `cancel` (or calling [`disconnect`](Self::disconnect))
    /// tears the session down.
    pub fn new(
        id: SessionId,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            addr,
            outbound,
            cancel,
            stopped: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address of the connection.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues a line for the client. Best-effort: never fails.
    pub fn send(&self, text: impl Into<String>) {
        if self.is_stopped() {
            debug!(session = %self.id, "Dropping line for stopped session");
            return;
        }
        if self.outbound.send(text.into()).is_err() {
            debug!(session = %self.id, "Writer gone, dropping line");
        }
    }

    /// Queues a server status notice.
    pub fn notice(&self, text: &str) {
        self.send(format_notice(text));
    }

    /// Marks the session stopped and cancels its tasks.
    ///
    /// Returns `true` only for the call that actually stopped the session.
    pub fn disconnect(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::AcqRel);
        self.cancel.cancel();
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Completes once the session has been told to shut down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

// ============================================================================
// Client Session
// ============================================================================

/// Per-connection state and command dispatch.
pub struct ClientSession {
    handle: SessionHandle,
    name: Option<String>,
    registry: Registry,
    broadcast: BroadcastEngine,

    /// Set once teardown has run
    disconnected: bool,
}

impl ClientSession {
    pub fn new(handle: SessionHandle, registry: Registry) -> Self {
        let broadcast = BroadcastEngine::new(registry.clone());
        Self {
            handle,
            name: None,
            registry,
            broadcast,
            disconnected: false,
        }
    }

    /// Splits `stream` and spawns the read loop and writer task on `tracker`.
    pub fn spawn<S>(
        stream: S,
        addr: SocketAddr,
        id: SessionId,
        registry: Registry,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> SessionHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (handle, outbound) = SessionHandle::new(id, addr, cancel);

        tracker.spawn(write_loop(writer, outbound, handle.clone()));
        tracker.spawn(ClientSession::new(handle.clone(), registry).run(reader));

        handle
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Display name, once registered.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Runs the read loop until the peer closes, a transport error occurs,
    /// or the session is disconnected.
    pub async fn run<R>(mut self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        debug!(session = %self.handle.id, addr = %self.handle.addr, "Client connected");
        let mut frames = FramedRead::new(reader, FrameCodec::new());

        loop {
            tokio::select! {
                biased;

                _ = self.handle.closed() => {
                    debug!(session = %self.handle.id, "Session cancelled");
                    break;
                }

                next = frames.next() => match next {
                    Some(Ok(raw)) => {
                        if let Err(e) = self.handle_frame(&raw).await {
                            warn!(
                                session = %self.handle.id,
                                client = ?self.name,
                                error = %e,
                                "Error handling frame"
                            );
                            self.registry
                                .observer()
                                .on_log(&format!("Bad frame from {}: {e}", self.describe()));
                        }
                    }
                    Some(Err(e)) => {
                        debug!(session = %self.handle.id, error = %e, "Connection read failed");
                        break;
                    }
                    None => {
                        debug!(session = %self.handle.id, "Client sent EOF");
                        break;
                    }
                }
            }
        }

        self.disconnect().await;
    }

    /// Closes the connection and deregisters the session.
    ///
    /// Idempotent: deregistration happens at most once.
    pub async fn disconnect(&mut self) {
        self.handle.disconnect();
        if std::mem::replace(&mut self.disconnected, true) {
            return;
        }

        match self.name.take() {
            Some(name) => {
                self.registry.remove_session(&name, self.handle.id).await;
                info!(session = %self.handle.id, client = %name, "Client disconnected");
            }
            None => {
                debug!(session = %self.handle.id, "Unnamed client disconnected");
                self.registry.observer().on_log(&format!(
                    "Unnamed connection from {} closed.",
                    self.handle.addr
                ));
            }
        }
    }

    /// Decodes one raw frame and dispatches it.
    async fn handle_frame(&mut self, raw: &[u8]) -> Result<(), ConnectionError> {
        let command = Command::decode(raw)?;
        debug!(session = %self.handle.id, command = command.token(), "Received command");
        self.handle_command(command).await;
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetName { name } => self.handle_set_name(name).await,

            Command::Subscribe { channel } => {
                let Some(name) = self.require_name("SUBSCRIBE") else {
                    return;
                };
                if self.registry.subscribe(name, &channel).await {
                    self.handle.notice(&format!("Subscribed to {channel}"));
                }
            }

            Command::Unsubscribe { channel } => {
                let Some(name) = self.require_name("UNSUBSCRIBE") else {
                    return;
                };
                if self.registry.unsubscribe(name, &channel).await {
                    self.handle.notice(&format!("Unsubscribed from {channel}"));
                }
            }

            Command::Message { channel, content } => {
                let Some(name) = self.require_name("MESSAGE") else {
                    return;
                };
                self.broadcast.publish(&channel, name, &content).await;
            }

            Command::Unrecognized { command, .. } => {
                warn!(session = %self.handle.id, command = %command, "Unrecognized command");
                self.registry.observer().on_log(&format!(
                    "Unrecognized command `{command}` from {}",
                    self.describe()
                ));
            }
        }
    }

    async fn handle_set_name(&mut self, name: String) {
        if self.name.is_some() {
            self.handle.notice(NOTICE_NAME_ALREADY_SET);
            return;
        }

        if name.trim().is_empty() {
            self.handle.notice(NOTICE_NAME_EMPTY);
            return;
        }

        if self.registry.add_client(&name, self.handle.clone()).await {
            self.name = Some(name);
            self.handle.notice(NOTICE_CONNECTED);
        } else {
            self.handle.notice(NOTICE_NAME_TAKEN);
            self.disconnect().await;
        }
    }

    /// Returns the display name, logging when the client has none yet.
    fn require_name(&self, command: &str) -> Option<&str> {
        if self.name.is_none() {
            debug!(session = %self.handle.id, command, "Ignoring command from unnamed client");
        }
        self.name.as_deref()
    }

    fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!("`{name}`"),
            None => self.handle.addr.to_string(),
        }
    }
}

// ============================================================================
// Writer Task
// ============================================================================

/// Drains the outbound queue to the socket until the session closes.
///
/// Lines queued before the disconnect are still written, then the write
/// half is shut down so the peer sees end of stream. Once the session is
/// closed, flushing and shutdown together take at most [`CLOSE_TIMEOUT`].
async fn write_loop<W>(writer: W, mut outbound: mpsc::UnboundedReceiver<String>, handle: SessionHandle)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::new());

    loop {
        tokio::select! {
            biased;

            line = outbound.recv() => match line {
                Some(line) => {
                    // A stalled write is abandoned once the session closes.
                    let written = tokio::select! {
                        biased;

                        result = write_line(&mut sink, line) => Some(result),
                        _ = handle.closed() => None,
                    };
                    match written {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            debug!(session = %handle.id, error = %e, "Failed to write to client");
                            handle.disconnect();
                            break;
                        }
                        None => break,
                    }
                }
                None => break,
            },

            _ = handle.closed() => break,
        }
    }

    if timeout(CLOSE_TIMEOUT, flush_and_close(&mut sink, &mut outbound, &handle))
        .await
        .is_err()
    {
        debug!(session = %handle.id, "Timed out flushing connection, dropping it");
    }
}

async fn flush_and_close<W>(
    sink: &mut FramedWrite<W, FrameCodec>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    handle: &SessionHandle,
) where
    W: AsyncWrite + Unpin,
{
    while let Ok(line) = outbound.try_recv() {
        if write_line(sink, line).await.is_err() {
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(session = %handle.id, error = %e, "Error closing connection");
    }
}

async fn write_line<W>(
    sink: &mut FramedWrite<W, FrameCodec>,
    line: String,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    match timeout(WRITE_TIMEOUT, sink.send(line)).await {
        Ok(result) => result.map_err(ConnectionError::from),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport error: {0}")]
    Codec(#[from] CodecError),

    #[error("Write timeout")]
    WriteTimeout,
}
