//! Integration tests for the TCP relay server.
//!
//! These tests drive the LifecycleController over real sockets on
//! 127.0.0.1, covering registration, broadcast, stop/restart and the
//! polled control path.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use disucord_protocol::Command;
use disucordd::config::Endpoint;
use disucordd::observer::{EventObserver, RelayEvent, TracingObserver};
use disucordd::registry::Registry;
use disucordd::server::{ControlHandle, LifecycleController, LifecycleState};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on waiting for any single server reaction
const READ_TIMEOUT: Duration = Duration::from_secs(2);

const CHANNELS: [&str; 2] = ["IF 100", "SPS 101"];

// ============================================================================
// Test Helpers
// ============================================================================

fn ephemeral() -> Endpoint {
    Endpoint::new("127.0.0.1", 0)
}

async fn start_server() -> (LifecycleController, SocketAddr) {
    let registry = Registry::new(CHANNELS, Arc::new(TracingObserver));
    let mut controller = LifecycleController::new(registry);
    let addr = controller.start(&ephemeral()).await.expect("server should start");
    (controller, addr)
}

/// A relay client speaking the wire protocol.
struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Connects and registers `name`, waiting for the confirmation.
    async fn named(addr: SocketAddr, name: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(Command::SetName { name: name.to_string() }).await;
        assert_eq!(client.next_line().await.as_deref(), Some("[Server]: Connected successfully."));
        client
    }

    async fn send(&mut self, command: Command) {
        self.send_raw(&command.encode()).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
    }

    async fn subscribe(&mut self, channel: &str) {
        self.send(Command::Subscribe { channel: channel.to_string() }).await;
        assert_eq!(
            self.next_line().await,
            Some(format!("[Server]: Subscribed to {channel}"))
        );
    }

    async fn message(&mut self, channel: &str, content: &str) {
        self.send(Command::Message {
            channel: channel.to_string(),
            content: content.to_string(),
        })
        .await;
    }

    /// Next line from the server, or `None` once the connection closed.
    async fn next_line(&mut self) -> Option<String> {
        match timeout(READ_TIMEOUT, self.lines.next_line()).await {
            Ok(Ok(line)) => line,
            Ok(Err(_)) => None,
            Err(_) => panic!("timed out waiting for a line from the server"),
        }
    }

    /// Asserts the server closes the connection, skipping queued lines.
    async fn expect_closed(&mut self) {
        while self.next_line().await.is_some() {}
    }

    /// Asserts nothing arrives within a short window.
    async fn expect_silence(&mut self) {
        let result = timeout(Duration::from_millis(150), self.lines.next_line()).await;
        assert!(result.is_err(), "unexpected data: {result:?}");
    }
}

// ============================================================================
// Broadcast
// ============================================================================

#[tokio::test]
async fn test_broadcast_reaches_every_subscriber() {
    let (mut server, addr) = start_server().await;

    let mut alice = TestClient::named(addr, "Alice").await;
    let mut bob = TestClient::named(addr, "Bob").await;
    alice.subscribe("IF 100").await;
    bob.subscribe("IF 100").await;

    bob.message("IF 100", "hello").await;

    assert_eq!(alice.next_line().await.as_deref(), Some("[IF 100] Bob: hello"));
    assert_eq!(bob.next_line().await.as_deref(), Some("[IF 100] Bob: hello"));

    server.stop().await;
}

#[tokio::test]
async fn test_message_to_other_channel_is_not_delivered() {
    let (mut server, addr) = start_server().await;

    let mut alice = TestClient::named(addr, "Alice").await;
    let mut bob = TestClient::named(addr, "Bob").await;
    alice.subscribe("IF 100").await;

    bob.message("SPS 101", "wrong room").await;
    bob.message("NOPE 1", "no room").await;
    alice.expect_silence().await;
    bob.expect_silence().await;

    server.stop().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (mut server, addr) = start_server().await;

    let mut alice = TestClient::named(addr, "Alice").await;
    let mut bob = TestClient::named(addr, "Bob").await;
    alice.subscribe("IF 100").await;

    alice.send(Command::Unsubscribe { channel: "IF 100".to_string() }).await;
    assert_eq!(
        alice.next_line().await.as_deref(),
        Some("[Server]: Unsubscribed from IF 100")
    );

    bob.message("IF 100", "anyone?").await;
    alice.expect_silence().await;

    server.stop().await;
}

#[tokio::test]
async fn test_escaped_content_is_delivered_unescaped() {
    let (mut server, addr) = start_server().await;

    let mut alice = TestClient::named(addr, "Alice").await;
    alice.subscribe("IF 100").await;

    alice.message("IF 100", r"path C:\temp\x and \e").await;
    assert_eq!(
        alice.next_line().await.as_deref(),
        Some(r"[IF 100] Alice: path C:\temp\x and \e")
    );

    server.stop().await;
}

#[tokio::test]
async fn test_frames_split_across_writes() {
    let (mut server, addr) = start_server().await;

    let mut client = TestClient::connect(addr).await;
    client.send_raw(b"SETNA").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.send_raw(b"ME\\xAli").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.send_raw(b"ce\\").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.send_raw(b"e").await;

    assert_eq!(
        client.next_line().await.as_deref(),
        Some("[Server]: Connected successfully.")
    );
    assert_eq!(server.registry().client_names().await, vec!["Alice".to_string()]);

    server.stop().await;
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_duplicate_name_rejected_and_disconnected() {
    let (mut server, addr) = start_server().await;

    let mut alice = TestClient::named(addr, "Alice").await;
    alice.subscribe("IF 100").await;

    let mut impostor = TestClient::connect(addr).await;
    impostor.send(Command::SetName { name: "Alice".to_string() }).await;
    assert_eq!(
        impostor.next_line().await.as_deref(),
        Some("[Server]: Username already taken.")
    );
    impostor.expect_closed().await;

    // The original session is untouched.
    assert_eq!(server.registry().client_names().await, vec!["Alice".to_string()]);
    assert_eq!(
        server.registry().subscribers("IF 100").await,
        Some(vec!["Alice".to_string()])
    );
    alice.message("IF 100", "still here").await;
    assert_eq!(
        alice.next_line().await.as_deref(),
        Some("[IF 100] Alice: still here")
    );

    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_frees_name() {
    let (mut server, addr) = start_server().await;

    let mut alice = TestClient::named(addr, "Alice").await;
    alice.subscribe("SPS 101").await;
    drop(alice);

    let registry = server.registry().clone();
    timeout(READ_TIMEOUT, async {
        while registry.contains_client("Alice").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("name should be released after disconnect");

    assert_eq!(registry.subscribers("SPS 101").await, Some(vec![]));
    let _again = TestClient::named(addr, "Alice").await;

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_and_malformed_frames_keep_connection_open() {
    let (mut server, addr) = start_server().await;

    let mut client = TestClient::connect(addr).await;
    client.send_raw(b"BOGUS\\xwhatever\\e").await;
    client.send_raw(b"SETNAME\\e").await;
    client.send_raw(b"\\e").await;
    client.send(Command::SetName { name: "Carol".to_string() }).await;

    assert_eq!(
        client.next_line().await.as_deref(),
        Some("[Server]: Connected successfully.")
    );

    server.stop().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_stop_closes_all_sessions_and_clears_registry() {
    let (mut server, addr) = start_server().await;

    let mut clients = Vec::new();
    for name in ["Alice", "Bob", "Carol"] {
        let mut client = TestClient::named(addr, name).await;
        client.subscribe("IF 100").await;
        client.subscribe("SPS 101").await;
        clients.push(client);
    }
    assert_eq!(server.registry().client_count().await, 3);

    server.stop().await;

    assert_eq!(server.state(), LifecycleState::Stopped);
    assert_eq!(server.registry().client_count().await, 0);
    for channel in CHANNELS {
        assert_eq!(server.registry().subscribers(channel).await, Some(vec![]));
    }
    for client in &mut clients {
        client.expect_closed().await;
    }
}

#[tokio::test]
async fn test_stop_closes_unnamed_sessions() {
    let (mut server, addr) = start_server().await;

    let mut lurker = TestClient::connect(addr).await;
    // Make sure the session is accepted before stopping.
    lurker.send_raw(b"BOGUS\\e").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.stop().await;
    lurker.expect_closed().await;
}

#[tokio::test]
async fn test_restart_starts_clean() {
    let (mut server, addr) = start_server().await;

    let mut alice = TestClient::named(addr, "Alice").await;
    alice.subscribe("IF 100").await;
    server.stop().await;
    alice.expect_closed().await;
    assert!(TcpStream::connect(addr).await.is_err());

    let addr = server.start(&ephemeral()).await.unwrap();
    assert_eq!(server.registry().subscribers("IF 100").await, Some(vec![]));

    let mut alice = TestClient::named(addr, "Alice").await;
    let mut bob = TestClient::named(addr, "Bob").await;
    bob.subscribe("IF 100").await;
    alice.message("IF 100", "back again").await;
    assert_eq!(bob.next_line().await.as_deref(), Some("[IF 100] Alice: back again"));

    server.stop().await;
}

#[tokio::test]
async fn test_observer_sees_roster_and_subscriber_snapshots() {
    let observer = Arc::new(EventObserver::new(64));
    let mut events = observer.subscribe();

    let registry = Registry::new(CHANNELS, observer.clone());
    let mut server = LifecycleController::new(registry);
    let addr = server.start(&ephemeral()).await.unwrap();

    let mut alice = TestClient::named(addr, "Alice").await;
    alice.subscribe("IF 100").await;
    server.stop().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    assert!(seen.contains(&RelayEvent::RosterChanged(vec!["Alice".to_string()])));
    assert!(seen.contains(&RelayEvent::ChannelSubscribersChanged {
        channel: "IF 100".to_string(),
        subscribers: vec!["Alice".to_string()],
    }));
    assert!(seen.contains(&RelayEvent::Log(format!("Server listening on {addr}"))));
    assert_eq!(seen.last(), Some(&RelayEvent::Log("Server stopped".to_string())));
}

#[tokio::test]
async fn test_polled_control_starts_and_stops_server() {
    let registry = Registry::new(CHANNELS, Arc::new(TracingObserver));
    let mut controller = LifecycleController::new(registry.clone());
    let mut state = controller.state_watcher();

    let control = ControlHandle::new(ephemeral());
    let shutdown = CancellationToken::new();

    let task = {
        let control = control.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            controller.run(control, shutdown).await;
            controller
        })
    };

    control.request_start();
    let running = timeout(READ_TIMEOUT, state.wait_for(|s| s.is_running()))
        .await
        .expect("server should start")
        .unwrap()
        .clone();
    let addr = running.local_addr().unwrap();

    let mut alice = TestClient::named(addr, "Alice").await;

    control.request_stop();
    timeout(READ_TIMEOUT, state.wait_for(|s| *s == LifecycleState::Stopped))
        .await
        .expect("server should stop")
        .unwrap();
    alice.expect_closed().await;
    assert_eq!(registry.client_count().await, 0);

    shutdown.cancel();
    let controller = timeout(READ_TIMEOUT, task).await.unwrap().unwrap();
    assert_eq!(controller.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_shutdown_stops_running_server() {
    let registry = Registry::new(CHANNELS, Arc::new(TracingObserver));
    let mut controller = LifecycleController::new(registry);
    let mut state = controller.state_watcher();

    let control = ControlHandle::new(ephemeral());
    control.request_start();
    let shutdown = CancellationToken::new();

    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            controller.run(control, shutdown).await;
            controller
        })
    };

    let addr = timeout(READ_TIMEOUT, state.wait_for(|s| s.is_running()))
        .await
        .unwrap()
        .unwrap()
        .local_addr()
        .unwrap();
    let mut bob = TestClient::named(addr, "Bob").await;

    shutdown.cancel();
    let controller = timeout(READ_TIMEOUT, task).await.unwrap().unwrap();
    assert!(!controller.is_running());
    bob.expect_closed().await;
}
