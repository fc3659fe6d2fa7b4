//! # Custom Transport Example
//!
//! Shows how to implement the [`Transport`] and [`Connector`] traits with an
//! in-process loopback channel. This is useful for:
//!
//! - **Testing**: exercise your chat logic without a real server
//! - **Custom backends**: adapt any I/O layer (TCP, QUIC, IPC)
//!
//! ## Running
//!
//! ```sh
//! cargo run --example custom_transport
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use spark_messaging_client::{
    ConnectOptions, Connector, MessageKind, SparkError, SparkMessaging, SparkOptions, Transport,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-based transport
// ─────────────────────────────────────────────────────────────────────

/// Client half of a loopback connection.
pub struct LoopbackTransport {
    /// Frames the client sends go here.
    tx: mpsc::UnboundedSender<String>,
    /// Frames from the server arrive here.
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, frame: String) -> Result<(), SparkError> {
        self.tx
            .send(frame)
            .map_err(|e| SparkError::TransportSend(e.to_string()))
    }

    /// Cancel-safe because `mpsc::UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String, SparkError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), SparkError> {
        self.rx.close();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A connector that spawns a toy server per connection
// ─────────────────────────────────────────────────────────────────────

/// Accepts one fixed key, acknowledges every room request and echoes
/// messages back.
pub struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, options: &ConnectOptions) -> Result<Box<dyn Transport>, SparkError> {
        tracing::info!("Opening loopback connection to {}", options.server_url);
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(server_rx, server_tx));
        Ok(Box::new(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

/// The fake server side of one connection.
async fn serve(mut rx: mpsc::UnboundedReceiver<String>, tx: mpsc::UnboundedSender<String>) {
    let send = |frame: Value| {
        let _ = tx.send(frame.to_string());
    };

    while let Some(text) = rx.recv().await {
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        tracing::info!("Server received: {frame}");
        let data = &frame["data"];
        match frame["event"].as_str() {
            Some("handshake") if data["auth"]["key"] == "pk_demo" => {
                send(json!({"event": "connect", "data": {"sid": "loopback-1"}}));
                send(json!({"event": "connected", "data": {"message": "Welcome to the loopback"}}));
            }
            Some("handshake") => {
                send(json!({"event": "connect_error", "data": {"message": "Invalid project key"}}));
            }
            Some("join-room" | "leave-room") => {
                send(json!({"event": "ack", "data": {"id": data["ack"]}}));
            }
            Some("message") => {
                let mut echo = data.clone();
                echo["user"] = json!("echo-bot");
                send(json!({"event": "message", "data": echo}));
            }
            Some("room-message") => {
                send(json!({"event": "room-message", "data": data}));
            }
            _ => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Drive the client
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let options = SparkOptions::new()
        .with_server_url("loopback://local")
        .with_project_key("pk_demo")
        .with_auto_connect(false);
    let client = SparkMessaging::with_connector(options, LoopbackConnector)?;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let direct = seen_tx.clone();
    let _messages = client.on_message(move |msg| {
        let _ = direct.send(format!(
            "{} says {}",
            msg.sender.as_deref().unwrap_or("?"),
            msg.content
        ));
    });
    let _room_messages = client.on_room_message(move |msg| {
        let _ = seen_tx.send(format!(
            "[{}] {}",
            msg.room.as_deref().unwrap_or("?"),
            msg.content
        ));
    });
    let _welcome = client.on_connected(|data| tracing::info!("Connected: {}", data.message));

    client.connect().await?;
    client.join_room("lobby").await?;
    client.send_message(MessageKind::Chat, "ping", Some("demo"))?;
    client.send_room_message("lobby", MessageKind::Chat, "hello lobby", Some("demo"))?;

    for _ in 0..2 {
        match seen_rx.recv().await {
            Some(line) => tracing::info!("Client saw: {line}"),
            None => break,
        }
    }

    client.leave_room("lobby").await?;
    client.disconnect();
    tracing::info!("Done. Custom transport works!");
    Ok(())
}
