//! Transport abstraction for the Spark Messaging protocol.
//!
//! The [`Transport`] trait is a bidirectional text frame channel between the
//! client and the server; each frame is one JSON-encoded protocol event.
//! Framing, heartbeats and TLS belong to the implementation.
//!
//! Opening a transport is the job of a [`Connector`]. The connection manager
//! calls [`Connector::open`] once per connection attempt with the resolved
//! [`ConnectOptions`], then performs the protocol handshake itself.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use spark_messaging_client::error::SparkError;
//! use spark_messaging_client::transport::{ConnectOptions, Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, frame: String) -> Result<(), SparkError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, SparkError>> {
//!         // Return None when the connection is closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SparkError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn open(&self, options: &ConnectOptions) -> Result<Box<dyn Transport>, SparkError> {
//!         todo!()
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SparkError;

/// A bidirectional text frame transport.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because the transport loop
/// polls it inside `tokio::select!`. Channel-based implementations are
/// naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one JSON text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`SparkError::TransportSend`] if the frame could not be sent.
    async fn send(&mut self, frame: String) -> Result<(), SparkError>;

    /// Receive the next JSON text frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly
    async fn recv(&mut self) -> Option<Result<String, SparkError>>;

    /// Close the transport gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources in that case.
    async fn close(&mut self) -> Result<(), SparkError>;
}

/// Everything a [`Connector`] needs to open a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Server endpoint, e.g. `http://localhost:3000`.
    pub server_url: String,
    /// Project credential. Sent in the handshake auth payload and, by
    /// connectors that support it, as the `key` query parameter.
    pub project_key: String,
    /// Whether the connector may retry a failed dial.
    pub reconnection: bool,
    /// Maximum number of dial retries.
    pub reconnection_attempts: u32,
    /// Delay between dial retries.
    pub reconnection_delay: Duration,
}

/// Opens [`Transport`]s.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport to `options.server_url`.
    ///
    /// # Errors
    ///
    /// Returns any dial failure, typically [`SparkError::Io`].
    async fn open(&self, options: &ConnectOptions) -> Result<Box<dyn Transport>, SparkError>;
}
