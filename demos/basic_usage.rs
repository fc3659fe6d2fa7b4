//! # Basic Usage Example
//!
//! Demonstrates a complete Spark Messaging client lifecycle:
//!
//! 1. Resolve the endpoint and project key from options and the environment
//! 2. Register callbacks before connecting (they are replayed on connect)
//! 3. Wait for the connection, join a room and send messages
//! 4. Shut down gracefully on Ctrl+C or server disconnect
//!
//! ## Running
//!
//! ```sh
//! # Start a Spark Messaging server on localhost:3000, then:
//! cargo run --example basic_usage
//!
//! # Override the endpoint and credential:
//! SERVER_URL=https://chat.example.com PROJECT_KEY=pk_live_123 cargo run --example basic_usage
//! ```

use spark_messaging_client::{MessageKind, SparkMessaging, SparkOptions};

/// Room joined by this example.
const ROOM: &str = "general";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    // Unset options fall back to SERVER_URL / PROJECT_KEY, then to defaults.
    // Auto-connect is off so the callbacks below are registered first.
    let client = SparkMessaging::new(
        SparkOptions::new()
            .with_auto_connect(false)
            .with_debug(true),
    )?;
    tracing::info!("Connecting to {}", client.config().server_url);

    // ── Callbacks ───────────────────────────────────────────────────
    // Registered before the connection exists; replayed once it is up.
    let _messages = client.on_message(|msg| {
        tracing::info!(
            "message from {}: {}",
            msg.sender.as_deref().unwrap_or("anonymous"),
            msg.content
        );
    });
    let _room_messages = client.on_room_message(|msg| {
        tracing::info!(
            "[{}] {}",
            msg.room.as_deref().unwrap_or("?"),
            msg.content
        );
    });
    let _welcome = client.on_connected(|data| {
        tracing::info!("{} (socket {})", data.message, data.socket_id);
    });
    let _errors = client.on_error(|err| {
        tracing::warn!(
            "error {}: {}",
            err.code.as_deref().unwrap_or("UNKNOWN_ERROR"),
            err.message
        );
    });

    let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();
    let _state = client.on_connection_state_change(move |connected| {
        if !connected {
            let _ = closed_tx.send(());
        }
    });

    // ── Connect ─────────────────────────────────────────────────────
    let connection = client.wait_for_connection().await?;
    tracing::info!("Connected as {}", connection.socket_id);

    // ── Rooms and messages ──────────────────────────────────────────
    client.join_room(ROOM).await?;
    tracing::info!("Joined {ROOM}, now in {:?}", client.joined_rooms());

    client.send_message(MessageKind::Chat, "hello from Rust", Some("rustacean"))?;
    client.send_room_message(ROOM, MessageKind::Chat, "hi room", Some("rustacean"))?;

    // ── Run until Ctrl+C or disconnect ─────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, leaving rooms");
            if let Err(e) = client.leave_all_rooms().await {
                tracing::warn!("leave failed: {e}");
            }
        }
        _ = closed_rx.recv() => {
            tracing::info!("Server closed the connection");
        }
    }

    client.disconnect();
    tracing::info!("Shut down cleanly");
    Ok(())
}
