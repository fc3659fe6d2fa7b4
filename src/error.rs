//! Error types for the Spark Messaging client.

use std::sync::Arc;

use thiserror::Error;

use crate::error_channel::ErrorRecord;
use crate::error_codes::ErrorCode;

/// Errors that can occur when using the Spark Messaging client.
///
/// The type is `Clone` so that one outcome can be shared by every caller
/// waiting on the same in-flight room request.
#[derive(Debug, Clone, Error)]
pub enum SparkError {
    /// Required configuration is missing or empty.
    #[error("{0}")]
    InvalidOptions(String),

    /// The transport reported `connect_error` during the handshake.
    #[error("{0}")]
    ConnectionError(String),

    /// The connection could not be established or was aborted.
    #[error("{0}")]
    ConnectionFailed(String),

    /// The connection was not established in time.
    #[error("connection timeout")]
    ConnectionTimeout,

    /// `connect()` was called while another attempt was still running.
    #[error("connection already in progress")]
    ConnectionInProgress,

    /// The server tore the connection down.
    #[error("server disconnected")]
    ServerDisconnect,

    /// The transport raised an `error` event.
    #[error("{message}")]
    Socket {
        /// Human-readable message from the transport.
        message: String,
        /// Code attached to the event, if any.
        code: Option<String>,
    },

    /// The background connect started at construction failed.
    #[error("{0}")]
    AutoConnectFailed(String),

    /// An operation needs a bound handler but `connect()` never succeeded.
    #[error("client is not initialized, call connect() first")]
    NotInitialized,

    /// An operation needs a live connection but the client is disconnected.
    #[error("socket is not connected")]
    NotConnected,

    /// A message could not be handed to the transport.
    #[error("{0}")]
    SendMessageFailed(String),

    /// A room message could not be handed to the transport.
    #[error("{0}")]
    SendRoomMessageFailed(String),

    /// The server rejected a join request.
    #[error("{message}")]
    JoinRoomFailed {
        /// Room the request targeted.
        room: String,
        /// Error text carried by the acknowledgement.
        message: String,
    },

    /// The server rejected a leave request.
    #[error("{message}")]
    LeaveRoomFailed {
        /// Room the request targeted.
        room: String,
        /// Error text carried by the acknowledgement.
        message: String,
    },

    /// A join or leave acknowledgement did not arrive in time.
    #[error("acknowledgement timed out for room {0}")]
    AckTimeout(String),

    /// Failed to serialize or deserialize a protocol frame.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// An I/O error occurred while dialing.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl SparkError {
    /// Returns the symbolic code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidOptions(_) => ErrorCode::InvalidOptions,
            Self::ConnectionError(_) => ErrorCode::ConnectionError,
            Self::ConnectionFailed(_) | Self::Io(_) => ErrorCode::ConnectionFailed,
            Self::ConnectionTimeout => ErrorCode::ConnectionTimeout,
            Self::ConnectionInProgress => ErrorCode::ConnectionInProgress,
            Self::ServerDisconnect => ErrorCode::ServerDisconnect,
            Self::Socket { code, .. } => code
                .as_deref()
                .and_then(ErrorCode::from_tag)
                .unwrap_or(ErrorCode::SocketError),
            Self::AutoConnectFailed(_) => ErrorCode::AutoConnectFailed,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::NotConnected | Self::TransportClosed => ErrorCode::NotConnected,
            Self::SendMessageFailed(_) => ErrorCode::SendMessageFailed,
            Self::SendRoomMessageFailed(_) => ErrorCode::SendRoomMessageFailed,
            Self::JoinRoomFailed { .. } => ErrorCode::JoinRoomFailed,
            Self::LeaveRoomFailed { .. } => ErrorCode::LeaveRoomFailed,
            Self::AckTimeout(_) => ErrorCode::AckTimeout,
            Self::Serialization(_) => ErrorCode::SerializationError,
            Self::TransportSend(_) | Self::TransportReceive(_) => ErrorCode::SocketError,
        }
    }

    /// Converts the error into the uniform notification shape.
    ///
    /// Server-supplied codes that are not part of [`ErrorCode`] are kept
    /// verbatim in the record's `code` field.
    pub fn to_record(&self) -> ErrorRecord {
        let code = match self {
            Self::Socket {
                code: Some(code), ..
            } => code.clone(),
            other => other.code().as_str().to_owned(),
        };
        ErrorRecord::new(self.to_string()).with_code(code)
    }

    /// Returns `true` for failures raised while establishing the connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::ConnectionError | ErrorCode::ConnectionFailed
        )
    }

    /// Returns `true` when the server rejected the project key.
    pub fn is_authentication_error(&self) -> bool {
        self.code() == ErrorCode::AuthenticationFailed
    }
}

impl From<serde_json::Error> for SparkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SparkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// A specialized [`Result`] type for Spark Messaging client operations.
pub type Result<T> = std::result::Result<T, SparkError>;
