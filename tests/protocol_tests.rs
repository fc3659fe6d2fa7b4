#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire-format tests for the Spark Messaging Client.
//!
//! Checks the JSON shape of every frame against fixtures in the server's
//! format, the `SCREAMING_SNAKE_CASE` error tags, the notification record
//! shape, and configuration resolution.

use std::time::Duration;

use serde_json::{json, Value};
use spark_messaging_client::config::{
    DEFAULT_PROJECT_KEY, DEFAULT_SERVER_URL, PROJECT_KEY_ENV, SERVER_URL_ENV,
};
use spark_messaging_client::error_codes::ErrorCode;
use spark_messaging_client::protocol::{AckPayload, AuthPayload, ConnectedPayload};
use spark_messaging_client::{
    ClientEvent, EnvConfig, ErrorRecord, Message, MessageKind, ServerEvent, SparkError,
    SparkOptions,
};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

fn encode(event: &ClientEvent) -> Value {
    serde_json::to_value(event).expect("serialize")
}

fn decode(fixture: &str) -> ServerEvent {
    serde_json::from_str(fixture).expect("deserialize")
}

fn fixed_message(room: Option<&str>) -> Message {
    Message {
        kind: MessageKind::Chat,
        content: "hello".into(),
        sender: Some("alice".into()),
        timestamp: Some(1_700_000_000_000),
        room: room.map(Into::into),
    }
}

// ════════════════════════════════════════════════════════════════════
// Client frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn handshake_carries_the_project_key() {
    let frame = encode(&ClientEvent::Handshake {
        auth: AuthPayload {
            key: "pk_live_123".into(),
        },
    });
    assert_eq!(
        frame,
        json!({"event": "handshake", "data": {"auth": {"key": "pk_live_123"}}})
    );
}

#[test]
fn message_frame_matches_server_format() {
    let frame = encode(&ClientEvent::Message(fixed_message(None)));
    assert_eq!(
        frame,
        json!({
            "event": "message",
            "data": {
                "type": "chat",
                "content": "hello",
                "user": "alice",
                "timestamp": 1_700_000_000_000_u64
            }
        })
    );
}

#[test]
fn room_message_frame_includes_room() {
    let frame = encode(&ClientEvent::RoomMessage(fixed_message(Some("lobby"))));
    assert_eq!(frame["event"], "room-message");
    assert_eq!(frame["data"]["room"], "lobby");
    assert_eq!(frame["data"]["type"], "chat");
}

#[test]
fn anonymous_message_omits_user() {
    let msg = Message::new(MessageKind::Notification, "ping", None);
    let frame = encode(&ClientEvent::Message(msg));
    assert_eq!(frame["data"]["type"], "notification");
    assert!(frame["data"].get("user").is_none());
}

#[test]
fn message_constructors_stamp_the_time() {
    let direct = Message::new(MessageKind::Test, "x", None);
    let scoped = Message::for_room("lobby", MessageKind::System, "y", Some("bob".into()));
    assert!(direct.timestamp.is_some_and(|ts| ts > 0));
    assert_eq!(direct.room, None);
    assert_eq!(scoped.room.as_deref(), Some("lobby"));
    assert_eq!(scoped.kind, MessageKind::System);
    assert_eq!(scoped.sender.as_deref(), Some("bob"));
}

#[test]
fn room_requests_use_dashed_event_names() {
    let join = encode(&ClientEvent::JoinRoom {
        room: "lobby".into(),
        ack: 1,
    });
    let leave = encode(&ClientEvent::LeaveRoom {
        room: "lobby".into(),
        ack: 2,
    });
    assert_eq!(join, json!({"event": "join-room", "data": {"room": "lobby", "ack": 1}}));
    assert_eq!(leave, json!({"event": "leave-room", "data": {"room": "lobby", "ack": 2}}));
}

#[test]
fn every_message_kind_is_lowercase_on_the_wire() {
    let kinds = [
        (MessageKind::Chat, "chat"),
        (MessageKind::Notification, "notification"),
        (MessageKind::System, "system"),
        (MessageKind::Test, "test"),
    ];
    for (kind, tag) in kinds {
        assert_eq!(serde_json::to_value(kind).unwrap(), json!(tag));
    }
}

#[test]
fn unknown_message_kind_is_rejected() {
    let fixture = r#"{"event":"message","data":{"type":"shout","content":"hi"}}"#;
    assert!(serde_json::from_str::<ServerEvent>(fixture).is_err());
}

// ════════════════════════════════════════════════════════════════════
// Server frames (fixtures in the server's format)
// ════════════════════════════════════════════════════════════════════

#[test]
fn connect_fixture_with_sid() {
    let event = decode(r#"{"event":"connect","data":{"sid":"Xy12_ab"}}"#);
    assert_eq!(
        event,
        ServerEvent::Connect {
            sid: Some("Xy12_ab".into())
        }
    );
}

#[test]
fn connect_error_fixture() {
    let event = decode(r#"{"event":"connect_error","data":{"message":"Invalid project key"}}"#);
    assert_eq!(
        event,
        ServerEvent::ConnectError {
            message: "Invalid project key".into()
        }
    );
}

#[test]
fn connected_welcome_fixture() {
    let event = decode(
        r#"{"event":"connected","data":{"message":"Welcome to Spark","socketId":"Xy12_ab"}}"#,
    );
    assert_eq!(
        event,
        ServerEvent::Connected(ConnectedPayload {
            message: Some("Welcome to Spark".into()),
            socket_id: Some("Xy12_ab".into()),
        })
    );
}

#[test]
fn connected_fixture_without_body_fields() {
    let event = decode(r#"{"event":"connected","data":{}}"#);
    assert_eq!(event, ServerEvent::Connected(ConnectedPayload::default()));
}

#[test]
fn relayed_message_fixture() {
    let event = decode(
        r#"{"event":"message","data":{"type":"chat","content":"hi there","user":"bob","timestamp":1700000000123}}"#,
    );
    let ServerEvent::Message(msg) = event else {
        panic!("expected a message");
    };
    assert_eq!(msg.content, "hi there");
    assert_eq!(msg.sender.as_deref(), Some("bob"));
    assert_eq!(msg.timestamp, Some(1_700_000_000_123));
}

#[test]
fn room_message_fixture() {
    let event = decode(
        r#"{"event":"room-message","data":{"type":"chat","content":"gm","room":"general","user":"carol"}}"#,
    );
    let ServerEvent::RoomMessage(msg) = event else {
        panic!("expected a room message");
    };
    assert_eq!(msg.room.as_deref(), Some("general"));
    assert_eq!(msg.sender.as_deref(), Some("carol"));
}

#[test]
fn error_fixture_with_and_without_code() {
    let coded = decode(r#"{"event":"error","data":{"message":"slow down","code":"RATE_LIMITED"}}"#);
    assert_eq!(
        coded,
        ServerEvent::Error {
            message: "slow down".into(),
            code: Some("RATE_LIMITED".into()),
        }
    );

    let bare = decode(r#"{"event":"error","data":{"message":"oops"}}"#);
    assert_eq!(
        bare,
        ServerEvent::Error {
            message: "oops".into(),
            code: None,
        }
    );
}

#[test]
fn disconnect_fixture() {
    let event = decode(r#"{"event":"disconnect","data":{"reason":"io server disconnect"}}"#);
    assert_eq!(
        event,
        ServerEvent::Disconnect {
            reason: "io server disconnect".into()
        }
    );
}

#[test]
fn ack_fixtures() {
    assert_eq!(
        decode(r#"{"event":"ack","data":{"id":42}}"#),
        ServerEvent::Ack(AckPayload { id: 42, error: None })
    );
    assert_eq!(
        decode(r#"{"event":"ack","data":{"id":43,"error":"Room is full"}}"#),
        ServerEvent::Ack(AckPayload {
            id: 43,
            error: Some("Room is full".into())
        })
    );
}

#[test]
fn malformed_frames_are_rejected() {
    let fixtures = [
        "",
        "not json",
        "{}",
        r#"{"event":"ack"}"#,
        r#"{"event":"ack","data":{"error":"missing id"}}"#,
        r#"{"data":{"sid":"x"}}"#,
        r#"["connect",{"sid":"x"}]"#,
    ];
    for fixture in fixtures {
        assert!(
            serde_json::from_str::<ServerEvent>(fixture).is_err(),
            "accepted {fixture:?}"
        );
    }
}

// ════════════════════════════════════════════════════════════════════
// Error codes and records
// ════════════════════════════════════════════════════════════════════

#[test]
fn error_code_tags_are_screaming_snake_case() {
    let codes = [
        (ErrorCode::InvalidOptions, "INVALID_OPTIONS"),
        (ErrorCode::ConnectionInProgress, "CONNECTION_IN_PROGRESS"),
        (ErrorCode::AutoConnectFailed, "AUTO_CONNECT_FAILED"),
        (ErrorCode::SendRoomMessageFailed, "SEND_ROOM_MESSAGE_FAILED"),
        (ErrorCode::AckTimeout, "ACK_TIMEOUT"),
    ];
    for (code, tag) in codes {
        assert_eq!(code.as_str(), tag);
        assert_eq!(serde_json::to_value(code).unwrap(), json!(tag));
        assert_eq!(ErrorCode::from_tag(tag), Some(code));
    }
    assert_eq!(ErrorCode::from_tag("RATE_LIMITED"), None);
}

#[test]
fn error_record_uses_camel_case_fields() {
    let record = ErrorRecord::coded(ErrorCode::ConnectionFailed, "refused")
        .with_status_code(503)
        .with_details(json!({"attempt": 2}));
    assert_eq!(
        serde_json::to_value(&record).unwrap(),
        json!({
            "message": "refused",
            "code": "CONNECTION_FAILED",
            "statusCode": 503,
            "details": {"attempt": 2}
        })
    );
}

#[test]
fn error_record_omits_absent_fields() {
    let record = ErrorRecord::new("plain");
    assert_eq!(serde_json::to_value(&record).unwrap(), json!({"message": "plain"}));
    assert_eq!(record.error_code(), ErrorCode::UnknownError);
}

#[test]
fn spark_errors_convert_to_records() {
    let record = SparkError::JoinRoomFailed {
        room: "vip".into(),
        message: "not allowed".into(),
    }
    .to_record();
    assert_eq!(record.message, "not allowed");
    assert_eq!(record.error_code(), ErrorCode::JoinRoomFailed);

    let socket = ErrorRecord::from(SparkError::Socket {
        message: "slow down".into(),
        code: Some("RATE_LIMITED".into()),
    });
    assert_eq!(socket.code.as_deref(), Some("RATE_LIMITED"));
    assert_eq!(socket.error_code(), ErrorCode::UnknownError);
}

// ════════════════════════════════════════════════════════════════════
// Configuration resolution
// ════════════════════════════════════════════════════════════════════

fn lookup(pairs: &'static [(&'static str, &'static str)]) -> EnvConfig {
    EnvConfig::from_lookup(|name| {
        pairs
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| (*value).to_owned())
    })
}

#[test]
fn environment_fills_unset_options() {
    let env = lookup(&[
        (SERVER_URL_ENV, "https://chat.example.com"),
        (PROJECT_KEY_ENV, "pk_env"),
    ]);
    let config = SparkOptions::new().resolve_with(env).unwrap();
    assert_eq!(config.server_url, "https://chat.example.com");
    assert_eq!(config.project_key, "pk_env");
}

#[test]
fn explicit_options_override_environment() {
    let env = lookup(&[
        (SERVER_URL_ENV, "https://chat.example.com"),
        (PROJECT_KEY_ENV, "pk_env"),
    ]);
    let config = SparkOptions::new()
        .with_server_url("http://localhost:4000")
        .with_project_key("pk_explicit")
        .resolve_with(env)
        .unwrap();
    assert_eq!(config.server_url, "http://localhost:4000");
    assert_eq!(config.project_key, "pk_explicit");
}

#[test]
fn empty_environment_values_count_as_unset() {
    let env = lookup(&[(SERVER_URL_ENV, ""), (PROJECT_KEY_ENV, "")]);
    assert_eq!(env, EnvConfig::default());
    let config = SparkOptions::new().resolve_with(env).unwrap();
    assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    assert_eq!(config.project_key, DEFAULT_PROJECT_KEY);
}

#[test]
fn blank_explicit_key_is_invalid() {
    let err = SparkOptions::new()
        .with_project_key("   ")
        .resolve_with(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, SparkError::InvalidOptions(_)));
    assert_eq!(err.code(), ErrorCode::InvalidOptions);
}

#[test]
fn timing_options_survive_resolution() {
    let config = SparkOptions::new()
        .with_reconnection(false)
        .with_reconnection_attempts(2)
        .with_reconnection_delay(Duration::from_millis(250))
        .with_ack_timeout(Duration::from_secs(3))
        .resolve_with(EnvConfig::default())
        .unwrap();
    let options = config.connect_options();
    assert!(!options.reconnection);
    assert_eq!(options.reconnection_attempts, 2);
    assert_eq!(options.reconnection_delay, Duration::from_millis(250));
    assert_eq!(config.ack_timeout, Duration::from_secs(3));
    assert_eq!(options.project_key, DEFAULT_PROJECT_KEY);
}
