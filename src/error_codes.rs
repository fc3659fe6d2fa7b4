//! Error codes for structured error handling in the Spark Messaging client.
//!
//! Codes serialize using `SCREAMING_SNAKE_CASE`, which is also the form used in
//! the `code` field of an [`ErrorRecord`](crate::ErrorRecord) and in the
//! server's `error` events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Symbolic error codes surfaced by the client.
///
/// Use [`as_str()`](ErrorCode::as_str) for the wire tag and
/// [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Configuration
    InvalidOptions,

    // Connection lifecycle
    ConnectionError,
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionInProgress,
    ServerDisconnect,
    SocketError,
    AutoConnectFailed,
    AuthenticationFailed,

    // Usage
    NotInitialized,
    NotConnected,

    // Send path
    SendMessageFailed,
    SendRoomMessageFailed,

    // Rooms
    JoinRoomFailed,
    LeaveRoomFailed,
    AckTimeout,

    // Fallbacks
    SerializationError,
    UnknownError,
}

impl ErrorCode {
    /// Returns the `SCREAMING_SNAKE_CASE` tag for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidOptions => "INVALID_OPTIONS",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::ConnectionInProgress => "CONNECTION_IN_PROGRESS",
            Self::ServerDisconnect => "SERVER_DISCONNECT",
            Self::SocketError => "SOCKET_ERROR",
            Self::AutoConnectFailed => "AUTO_CONNECT_FAILED",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::SendMessageFailed => "SEND_MESSAGE_FAILED",
            Self::SendRoomMessageFailed => "SEND_ROOM_MESSAGE_FAILED",
            Self::JoinRoomFailed => "JOIN_ROOM_FAILED",
            Self::LeaveRoomFailed => "LEAVE_ROOM_FAILED",
            Self::AckTimeout => "ACK_TIMEOUT",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Parses a wire tag back into a code. Unrecognised tags yield `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(tag.to_owned())).ok()
    }

    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidOptions => {
                "The client configuration is invalid. A server URL and a project key are required."
            }
            Self::ConnectionError => "The transport reported an error while connecting.",
            Self::ConnectionFailed => "The connection could not be established.",
            Self::ConnectionTimeout => {
                "The connection was not established within the configured timeout."
            }
            Self::ConnectionInProgress => {
                "A connection attempt is already in progress. Wait for it to finish."
            }
            Self::ServerDisconnect => "The server closed the connection.",
            Self::SocketError => "The transport reported an error.",
            Self::AutoConnectFailed => "The automatic connection attempt failed.",
            Self::AuthenticationFailed => {
                "The server rejected the project key. Verify your credentials."
            }
            Self::NotInitialized => "The client is not initialized. Call connect() first.",
            Self::NotConnected => "The client is not connected to the server.",
            Self::SendMessageFailed => "The message could not be handed to the transport.",
            Self::SendRoomMessageFailed => {
                "The room message could not be handed to the transport."
            }
            Self::JoinRoomFailed => "The server refused to join the room.",
            Self::LeaveRoomFailed => "The server refused to leave the room.",
            Self::AckTimeout => "The server did not acknowledge the request in time.",
            Self::SerializationError => "A protocol frame could not be encoded or decoded.",
            Self::UnknownError => "An unknown error occurred.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn as_str_matches_serde_tag() {
        for code in [
            ErrorCode::InvalidOptions,
            ErrorCode::ServerDisconnect,
            ErrorCode::SendRoomMessageFailed,
            ErrorCode::AckTimeout,
            ErrorCode::UnknownError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn from_tag_parses_known_codes_only() {
        assert_eq!(
            ErrorCode::from_tag("CONNECTION_ERROR"),
            Some(ErrorCode::ConnectionError)
        );
        assert_eq!(ErrorCode::from_tag("ROOM_FULL"), None);
    }
}
