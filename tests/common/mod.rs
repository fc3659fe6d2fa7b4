#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Spark Messaging Client integration tests.
//!
//! Provides a [`MockConnector`] whose transports are channel pairs. Every
//! opened connection hands its server side, a [`MockServer`], to the test,
//! pre-loaded with a scripted greeting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use spark_messaging_client::{ConnectOptions, Connector, SparkError, SparkOptions, Transport};
use tokio::sync::mpsc;

/// Upper bound for any single wait in these tests.
pub const STEP: Duration = Duration::from_secs(2);

// ── Mock transport ──────────────────────────────────────────────────

struct ChannelTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: String) -> Result<(), SparkError> {
        self.to_server
            .send(frame)
            .map_err(|_| SparkError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, SparkError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), SparkError> {
        self.from_server.close();
        Ok(())
    }
}

/// Server side of one mock connection.
pub struct MockServer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl MockServer {
    /// Push one frame to the client.
    pub fn push(&self, frame: Value) {
        // The client may already have gone away; tests assert on that separately.
        let _ = self.to_client.send(frame.to_string());
    }

    /// Next frame the client sent, decoded.
    pub async fn next_frame(&mut self) -> Value {
        let text = tokio::time::timeout(STEP, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client transport closed");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Next frame the client sent, if one is already queued.
    pub fn try_next_frame(&mut self) -> Option<Value> {
        self.from_client
            .try_recv()
            .ok()
            .map(|text| serde_json::from_str(&text).expect("client sent invalid JSON"))
    }

    /// Consume the handshake and return the key it carried.
    pub async fn expect_handshake(&mut self) -> String {
        let frame = self.next_frame().await;
        assert_eq!(frame["event"], "handshake", "unexpected first frame {frame}");
        frame["data"]["auth"]["key"]
            .as_str()
            .expect("handshake without key")
            .to_owned()
    }

    /// Answer the next `join-room` / `leave-room` request. Returns the event
    /// name and room.
    pub async fn answer_room_request(&mut self, error: Option<&str>) -> (String, String) {
        let frame = self.next_frame().await;
        let event = frame["event"].as_str().expect("frame without event").to_owned();
        assert!(
            event == "join-room" || event == "leave-room",
            "expected a room request, got {frame}"
        );
        let room = frame["data"]["room"].as_str().expect("room").to_owned();
        self.push(ack_frame(frame["data"]["ack"].as_u64().expect("ack id"), error));
        (event, room)
    }
}

// ── Mock connector ──────────────────────────────────────────────────

/// Opens [`ChannelTransport`]s and hands their server side to the test.
pub struct MockConnector {
    greeting: Vec<Value>,
    servers: mpsc::UnboundedSender<MockServer>,
    opened: Arc<AtomicUsize>,
    last_options: Arc<StdMutex<Option<ConnectOptions>>>,
}

/// Test-side view of a [`MockConnector`] after it was moved into a client.
pub struct MockHandles {
    pub servers: mpsc::UnboundedReceiver<MockServer>,
    pub opened: Arc<AtomicUsize>,
    pub last_options: Arc<StdMutex<Option<ConnectOptions>>>,
}

impl MockHandles {
    /// Wait for the next connection the client opens.
    pub async fn next_server(&mut self) -> MockServer {
        tokio::time::timeout(STEP, self.servers.recv())
            .await
            .expect("timed out waiting for the client to connect")
            .expect("connector dropped")
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

/// A connector whose every connection is greeted with `greeting`.
pub fn mock_connector(greeting: Vec<Value>) -> (MockConnector, MockHandles) {
    let (servers, server_rx) = mpsc::unbounded_channel();
    let opened = Arc::new(AtomicUsize::new(0));
    let last_options = Arc::new(StdMutex::new(None));
    let connector = MockConnector {
        greeting,
        servers,
        opened: Arc::clone(&opened),
        last_options: Arc::clone(&last_options),
    };
    let handles = MockHandles {
        servers: server_rx,
        opened,
        last_options,
    };
    (connector, handles)
}

/// A connector that accepts every handshake with socket id `sid`.
pub fn accepting(sid: &str) -> (MockConnector, MockHandles) {
    mock_connector(vec![connect_frame(Some(sid))])
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, options: &ConnectOptions) -> Result<Box<dyn Transport>, SparkError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let server = MockServer {
            from_client,
            to_client,
        };
        for frame in &self.greeting {
            server.push(frame.clone());
        }
        let _ = self.servers.send(server);
        Ok(Box::new(ChannelTransport {
            to_server,
            from_server,
        }))
    }
}

// ── Options ─────────────────────────────────────────────────────────

/// Explicit endpoint and key, no auto-connect.
pub fn manual_options() -> SparkOptions {
    SparkOptions::new()
        .with_server_url("http://spark.test:3000")
        .with_project_key("pk_test_123")
        .with_auto_connect(false)
}

// ── Frame builders ──────────────────────────────────────────────────

pub fn connect_frame(sid: Option<&str>) -> Value {
    match sid {
        Some(sid) => json!({"event": "connect", "data": {"sid": sid}}),
        None => json!({"event": "connect", "data": {}}),
    }
}

pub fn connect_error_frame(message: &str) -> Value {
    json!({"event": "connect_error", "data": {"message": message}})
}

pub fn message_frame(kind: &str, content: &str) -> Value {
    json!({"event": "message", "data": {"type": kind, "content": content, "user": "server"}})
}

pub fn room_message_frame(room: &str, content: &str) -> Value {
    json!({"event": "room-message", "data": {"type": "chat", "content": content, "room": room}})
}

pub fn connected_frame(message: &str) -> Value {
    json!({"event": "connected", "data": {"message": message}})
}

pub fn error_frame(message: &str, code: Option<&str>) -> Value {
    match code {
        Some(code) => json!({"event": "error", "data": {"message": message, "code": code}}),
        None => json!({"event": "error", "data": {"message": message}}),
    }
}

pub fn disconnect_frame(reason: &str) -> Value {
    json!({"event": "disconnect", "data": {"reason": reason}})
}

pub fn ack_frame(id: u64, error: Option<&str>) -> Value {
    match error {
        Some(error) => json!({"event": "ack", "data": {"id": id, "error": error}}),
        None => json!({"event": "ack", "data": {"id": id}}),
    }
}

// ── Recording callbacks ─────────────────────────────────────────────

/// A thread-safe log that callbacks append to.
#[derive(Clone, Default)]
pub struct Recorder<T>(Arc<StdMutex<Vec<T>>>);

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self(Arc::new(StdMutex::new(Vec::new())))
    }

    pub fn push(&self, value: T) {
        self.0.lock().unwrap().push(value);
    }

    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Give background tasks a moment to drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// Install a `tracing` subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
