//! Wire types for the Spark Messaging protocol.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`. Field
//! names inside payloads follow the server's format (`type`, `user`,
//! `socketId`), which is why several Rust fields carry `serde` renames.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Disconnect reason the server sends when it closes the socket itself.
pub const SERVER_DISCONNECT_REASON: &str = "io server disconnect";

// ── Messages ────────────────────────────────────────────────────────

/// The closed set of message kinds understood by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Chat,
    Notification,
    System,
    Test,
}

/// A chat or notification message, inbound or outbound.
///
/// Outbound messages are stamped with the send time. Inbound ones carry
/// whatever the server relayed, so every optional field may be absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    /// Sender identity, `user` on the wire.
    #[serde(rename = "user", default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl Message {
    /// Builds a point-to-point message stamped with the current time.
    pub fn new(kind: MessageKind, content: impl Into<String>, sender: Option<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            sender,
            timestamp: Some(now_millis()),
            room: None,
        }
    }

    /// Builds a room-scoped message stamped with the current time.
    pub fn for_room(
        room: impl Into<String>,
        kind: MessageKind,
        content: impl Into<String>,
        sender: Option<String>,
    ) -> Self {
        Self {
            room: Some(room.into()),
            ..Self::new(kind, content, sender)
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ── Payloads ────────────────────────────────────────────────────────

/// Credential carried by the handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub key: String,
}

/// Body of the server's `connected` welcome event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        rename = "socketId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub socket_id: Option<String>,
}

/// Reply to a `join-room` or `leave-room` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// The `ack` id of the request being answered.
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Frames ──────────────────────────────────────────────────────────

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// First frame of every connection.
    #[serde(rename = "handshake")]
    Handshake { auth: AuthPayload },
    #[serde(rename = "message")]
    Message(Message),
    #[serde(rename = "room-message")]
    RoomMessage(Message),
    /// Expects one [`ServerEvent::Ack`] with the same `ack` id.
    #[serde(rename = "join-room")]
    JoinRoom { room: String, ack: u64 },
    /// Expects one [`ServerEvent::Ack`] with the same `ack` id.
    #[serde(rename = "leave-room")]
    LeaveRoom { room: String, ack: u64 },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Handshake accepted. `sid` is the socket id, if the server assigns one.
    #[serde(rename = "connect")]
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sid: Option<String>,
    },
    /// Handshake rejected.
    #[serde(rename = "connect_error")]
    ConnectError {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    #[serde(rename = "disconnect")]
    Disconnect {
        #[serde(default)]
        reason: String,
    },
    #[serde(rename = "connected")]
    Connected(ConnectedPayload),
    #[serde(rename = "message")]
    Message(Message),
    #[serde(rename = "room-message")]
    RoomMessage(Message),
    #[serde(rename = "ack")]
    Ack(AckPayload),
}

// ── Consumer-facing connection data ────────────────────────────────

/// Delivered to `on_connected` callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedData {
    pub message: String,
    pub socket_id: String,
    /// Local time the connection was established, when known.
    pub connected_at: Option<SystemTime>,
}

/// Returned by `wait_for_connection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionData {
    pub socket_id: String,
    pub connected_at: SystemTime,
}

/// Snapshot returned by `connection_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub socket_id: Option<String>,
    pub connected_at: Option<SystemTime>,
}
