//! Uniform error notifications.
//!
//! Background failures (auto-connect, transport `error` events, server-side
//! disconnects) have no caller to receive an `Err`, so they are broadcast to
//! the subscribers of an [`ErrorChannel`] as [`ErrorRecord`]s instead.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SparkError;
use crate::error_codes::ErrorCode;
use crate::subscription::{dispatch, lock, Registry, Subscription};

/// A failure in the shape delivered to error subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorRecord {
    /// A record carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status_code: None,
            details: None,
        }
    }

    /// A record with a message and a well-known code.
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(message).with_code(code.as_str())
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The record's code as a well-known [`ErrorCode`], or
    /// [`UnknownError`](ErrorCode::UnknownError) when absent or unrecognised.
    pub fn error_code(&self) -> ErrorCode {
        self.code
            .as_deref()
            .and_then(ErrorCode::from_tag)
            .unwrap_or(ErrorCode::UnknownError)
    }
}

impl From<&str> for ErrorRecord {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ErrorRecord {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&SparkError> for ErrorRecord {
    fn from(err: &SparkError) -> Self {
        err.to_record()
    }
}

impl From<SparkError> for ErrorRecord {
    fn from(err: SparkError) -> Self {
        err.to_record()
    }
}

/// Broadcasts [`ErrorRecord`]s to registered callbacks.
///
/// Cloning yields another handle to the same subscriber list.
#[derive(Debug, Clone, Default)]
pub struct ErrorChannel {
    callbacks: Arc<Mutex<Registry<ErrorRecord>>>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an error callback.
    pub fn on_error(
        &self,
        callback: impl Fn(&ErrorRecord) + Send + Sync + 'static,
    ) -> Subscription {
        let id = lock(&self.callbacks).insert(Arc::new(callback));
        Subscription::for_registry(id, &self.callbacks)
    }

    /// Normalises `error` into a record and delivers it to every subscriber.
    pub fn report(&self, error: impl Into<ErrorRecord>) {
        let record = error.into();
        warn!(
            code = record.code.as_deref().unwrap_or("-"),
            "{}", record.message
        );
        dispatch("error", &self.callbacks, &record);
    }

    /// Drops every error subscriber.
    pub fn clear(&self) {
        lock(&self.callbacks).clear();
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.callbacks).len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn report_normalises_strings_and_errors() {
        let channel = ErrorChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = channel.on_error(move |record| sink.lock().unwrap().push(record.clone()));

        channel.report("plain text");
        channel.report(SparkError::ServerDisconnect);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ErrorRecord::new("plain text"));
        assert_eq!(seen[0].error_code(), ErrorCode::UnknownError);
        assert_eq!(seen[1].code.as_deref(), Some("SERVER_DISCONNECT"));
        assert_eq!(seen[1].message, "server disconnected");
    }

    #[test]
    fn unsubscribe_and_clear_stop_delivery() {
        let channel = ErrorChannel::new();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let sub = channel.on_error(move |_| *sink.lock().unwrap() += 1);
        let sink = Arc::clone(&count);
        let _other = channel.on_error(move |_| *sink.lock().unwrap() += 10);

        channel.report("one");
        sub.unsubscribe();
        channel.report("two");
        channel.clear();
        channel.report("three");

        assert_eq!(*count.lock().unwrap(), 21);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = ErrorRecord::coded(ErrorCode::ConnectionError, "refused")
            .with_status_code(503)
            .with_details(serde_json::json!({"retry": true}));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["statusCode"], 503);
        assert_eq!(json["code"], "CONNECTION_ERROR");
        assert_eq!(json["details"]["retry"], true);
    }
}
