//! # Spark Messaging Client
//!
//! Async Rust client for the Spark Messaging real-time chat service.
//!
//! The client speaks a small JSON event protocol over any bidirectional text
//! transport and provides:
//!
//! - **Connection lifecycle**: handshake with a project key, idempotent
//!   connect and disconnect, background auto-connect
//! - **Messaging**: point-to-point and room messages with ordered callbacks
//! - **Rooms**: acknowledged join/leave with idempotent membership tracking
//! - **Early subscriptions**: callbacks registered before connecting are
//!   queued and replayed once the connection is up, before any inbound event
//! - **Pluggable transports**: implement [`Transport`] and [`Connector`], or use
//!   the built-in WebSocket transport (default `transport-websocket` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "transport-websocket")]
//! # async fn example() -> Result<(), spark_messaging_client::SparkError> {
//! use spark_messaging_client::{MessageKind, SparkMessaging};
//!
//! let client = SparkMessaging::with_credentials("http://localhost:3000", "pk_live_123")?;
//! let _sub = client.on_message(|msg| println!("got: {}", msg.content));
//! let _errors = client.on_error(|err| eprintln!("error: {}", err.message));
//!
//! let connection = client.wait_for_connection().await?;
//! println!("connected as {}", connection.socket_id);
//!
//! client.send_message(MessageKind::Chat, "hello", Some("alice"))?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod error_channel;
pub mod error_codes;
pub mod messages;
pub mod protocol;
pub mod rooms;
pub mod subscription;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::SparkMessaging;
pub use config::{EnvConfig, SparkConfig, SparkOptions};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{Result, SparkError};
pub use error_channel::{ErrorChannel, ErrorRecord};
pub use error_codes::ErrorCode;
pub use messages::MessageChannel;
pub use protocol::{
    ClientEvent, ConnectedData, ConnectionData, ConnectionStatus, Message, MessageKind,
    ServerEvent,
};
pub use rooms::RoomManager;
pub use subscription::{Subscription, SubscriptionId};
pub use transport::{ConnectOptions, Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
