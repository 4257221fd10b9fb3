//! TCP relay server and its lifecycle.
//!
//! The [`LifecycleController`] owns the listening socket. A polling loop
//! samples the [`ControlHandle`] every [`POLL_INTERVAL`] and starts or
//! stops the accept loop to match the desired state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  poll   ┌──────────────────────┐
//! │  ControlHandle  │◀────────│ LifecycleController  │
//! │ (flag+endpoint) │         │ Stopped/Running/...  │
//! └─────────────────┘         └──────────┬───────────┘
//!                                        │ spawn
//!                                        ▼
//!                             ┌──────────────────────┐
//!                             │  accept loop         │
//!                             │  TcpListener         │
//!                             └──────────┬───────────┘
//!                                        │ accept()
//!                                        ▼
//! ┌─────────────────┐         ┌──────────────────────┐
//! │    Registry     │◀────────│ ClientSession        │
//! │                 │         │ (read + writer task) │
//! └─────────────────┘         └──────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Bind and accept failures are logged; the controller keeps running
//! - Stop is safe while sessions are tearing themselves down

mod connection;
mod control;

pub use connection::{
    format_notice, ClientSession, ConnectionError, SessionHandle, SessionId, NOTICE_CONNECTED,
    NOTICE_NAME_ALREADY_SET, NOTICE_NAME_EMPTY, NOTICE_NAME_TAKEN, SERVER_ALIAS,
};
pub use control::ControlHandle;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Endpoint;
use crate::registry::Registry;

/// How often the control signal is sampled
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on waiting for session tasks during stop
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Observable server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Running { local_addr: SocketAddr },
    Stopping,
}

impl LifecycleState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Running { local_addr } => Some(*local_addr),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running { local_addr } => write!(f, "running on {local_addr}"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Resources of one running server instance.
struct ActiveServer {
    local_addr: SocketAddr,

    /// Stops the accept loop
    accept_cancel: CancellationToken,

    /// Parent of every session token in this run
    sessions_cancel: CancellationToken,

    accept_task: JoinHandle<()>,

    /// Session read and writer tasks
    sessions: TaskTracker,
}

impl Drop for ActiveServer {
    fn drop(&mut self) {
        self.accept_cancel.cancel();
        self.sessions_cancel.cancel();
    }
}

/// Starts and stops the relay.
pub struct LifecycleController {
    registry: Registry,
    state: watch::Sender<LifecycleState>,

    /// Source of session ids, monotonic across restarts
    connection_counter: Arc<AtomicU64>,

    active: Option<ActiveServer>,
}

impl LifecycleController {
    pub fn new(registry: Registry) -> Self {
        let (state, _) = watch::channel(LifecycleState::Stopped);
        Self {
            registry,
            state,
            connection_counter: Arc::new(AtomicU64::new(1)),
            active: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn state_watcher(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Binds `endpoint` and spawns the accept loop.
    ///
    /// Returns the bound address, which differs from `endpoint` when it
    /// asked for port 0.
    pub async fn start(&mut self, endpoint: &Endpoint) -> Result<SocketAddr, ServerError> {
        if let Some(active) = &self.active {
            return Err(ServerError::AlreadyRunning {
                addr: active.local_addr,
            });
        }

        let bind_error = |e: std::io::Error| ServerError::Bind {
            endpoint: endpoint.to_string(),
            error: e.to_string(),
        };
        let listener = TcpListener::bind((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let accept_cancel = CancellationToken::new();
        let sessions_cancel = CancellationToken::new();
        let sessions = TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            Arc::clone(&self.connection_counter),
            accept_cancel.clone(),
            sessions_cancel.clone(),
            sessions.clone(),
        ));

        self.active = Some(ActiveServer {
            local_addr,
            accept_cancel,
            sessions_cancel,
            accept_task,
            sessions,
        });
        self.state.send_replace(LifecycleState::Running { local_addr });

        info!(addr = %local_addr, "Relay server listening");
        self.registry
            .observer()
            .on_log(&format!("Server listening on {local_addr}"));

        Ok(local_addr)
    }

    /// Stops accepting, disconnects every session and resets the registry.
    ///
    /// No-op when already stopped.
    pub async fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        self.state.send_replace(LifecycleState::Stopping);
        info!(addr = %active.local_addr, "Stopping relay server");

        active.accept_cancel.cancel();
        if let Err(e) = (&mut active.accept_task).await {
            warn!(error = %e, "Accept loop ended abnormally");
        }

        let sessions = self.registry.sessions().await;
        debug!(count = sessions.len(), "Disconnecting registered sessions");
        for session in &sessions {
            session.disconnect();
        }

        // Unnamed sessions are not in the registry.
        active.sessions_cancel.cancel();
        active.sessions.close();
        if timeout(SHUTDOWN_TIMEOUT, active.sessions.wait()).await.is_err() {
            warn!(
                remaining = active.sessions.len(),
                "Timed out waiting for sessions to finish"
            );
        }

        self.registry.reset().await;
        drop(active);

        self.state.send_replace(LifecycleState::Stopped);
        info!("Relay server stopped");
        self.registry.observer().on_log("Server stopped");
    }

    /// Drives the controller from `control` until `shutdown` fires, then
    /// stops the server.
    pub async fn run(&mut self, control: ControlHandle, shutdown: CancellationToken) {
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Controller shutdown requested");
                    break;
                }

                _ = ticker.tick() => self.poll(&control).await,
            }
        }

        self.stop().await;
    }

    /// Reconciles the server with the desired state once.
    async fn poll(&mut self, control: &ControlHandle) {
        match (control.is_running_requested(), self.is_running()) {
            (true, false) => {
                let endpoint = control.endpoint();
                if let Err(e) = self.start(&endpoint).await {
                    error!(endpoint = %endpoint, error = %e, "Failed to start relay server");
                    self.registry
                        .observer()
                        .on_log(&format!("Failed to start server: {e}"));
                    control.request_stop();
                }
            }
            (false, true) => self.stop().await,
            _ => {}
        }
    }
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Accepts connections until `cancel` fires. Each connection gets its
/// session immediately.
async fn accept_loop(
    listener: TcpListener,
    registry: Registry,
    counter: Arc<AtomicU64>,
    cancel: CancellationToken,
    sessions_cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Accept loop cancelled");
                break;
            }

            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let id = SessionId::new(counter.fetch_add(1, Ordering::Relaxed));
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(session = %id, error = %e, "Failed to set TCP_NODELAY");
                    }
                    ClientSession::spawn(
                        stream,
                        addr,
                        id,
                        registry.clone(),
                        sessions_cancel.child_token(),
                        &tracker,
                    );
                    debug!(session = %id, addr = %addr, "Accepted connection");
                    registry
                        .observer()
                        .on_log(&format!("New client handler started for {addr}"));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    registry
                        .observer()
                        .on_log(&format!("Error accepting connection: {e}"));
                }
            }
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {endpoint}: {error}")]
    Bind { endpoint: String, error: String },

    #[error("Server already running on {addr}")]
    AlreadyRunning { addr: SocketAddr },
}
