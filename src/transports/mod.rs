//! Built-in transport implementations.
//!
//! Each transport sits behind a feature gate:
//!
//! | Feature                | Transport              | Connector              |
//! |------------------------|------------------------|------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`] | [`WebSocketConnector`] |
//!
//! Custom backends implement [`Transport`](crate::Transport) and
//! [`Connector`](crate::Connector) and are passed to
//! [`SparkMessaging::with_connector`](crate::SparkMessaging::with_connector).

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};
