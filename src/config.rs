//! Client configuration.
//!
//! Values are resolved with the precedence *explicit option > environment >
//! built-in default*. Explicit values come from [`SparkOptions`], environment
//! values from [`EnvConfig`], and the result is a fully populated
//! [`SparkConfig`].
//!
//! # Example
//!
//! ```
//! use spark_messaging_client::config::{EnvConfig, SparkOptions};
//!
//! let config = SparkOptions::new()
//!     .with_server_url("https://chat.example.com")
//!     .with_project_key("pk_live_123")
//!     .with_auto_connect(false)
//!     .resolve_with(EnvConfig::default())
//!     .unwrap();
//! assert_eq!(config.server_url, "https://chat.example.com");
//! assert_eq!(config.reconnection_attempts, 5);
//! ```

use std::time::Duration;

use crate::error::{Result, SparkError};
use crate::transport::ConnectOptions;

/// Server endpoint used when neither an option nor the environment sets one.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";

/// Project key used when neither an option nor the environment sets one.
pub const DEFAULT_PROJECT_KEY: &str = "default-project-key-12345";

/// Environment variable holding the server endpoint.
pub const SERVER_URL_ENV: &str = "SERVER_URL";

/// Environment variable holding the project key.
pub const PROJECT_KEY_ENV: &str = "PROJECT_KEY";

const DEFAULT_RECONNECTION_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECTION_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECTION_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

// ── Resolved configuration ──────────────────────────────────────────

/// Fully resolved configuration of a [`SparkMessaging`](crate::SparkMessaging)
/// client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparkConfig {
    /// Server endpoint. `http(s)://` and `ws(s)://` schemes are accepted.
    pub server_url: String,
    /// Project credential sent with the handshake.
    pub project_key: String,
    /// Connect in the background as soon as the client is constructed.
    ///
    /// Defaults to **true**.
    pub auto_connect: bool,
    /// Allow the connector to retry a failed dial. Defaults to **true**.
    pub reconnection: bool,
    /// Maximum dial retries. Defaults to **5**.
    pub reconnection_attempts: u32,
    /// Delay between dial retries. Defaults to **1 second**.
    pub reconnection_delay: Duration,
    /// Log lifecycle transitions at `info` instead of `debug`.
    pub debug: bool,
    /// Upper bound on dial plus handshake. Defaults to **20 seconds**.
    pub connect_timeout: Duration,
    /// Upper bound on a join/leave acknowledgement. Defaults to **10 seconds**.
    pub ack_timeout: Duration,
    /// Upper bound for `wait_for_connection`. Defaults to **30 seconds**.
    pub connection_wait_timeout: Duration,
}

impl SparkConfig {
    /// Create a configuration with the given endpoint and key and default
    /// values for everything else. The environment is not consulted.
    pub fn new(server_url: impl Into<String>, project_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            project_key: project_key.into(),
            auto_connect: true,
            reconnection: true,
            reconnection_attempts: DEFAULT_RECONNECTION_ATTEMPTS,
            reconnection_delay: DEFAULT_RECONNECTION_DELAY,
            debug: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            connection_wait_timeout: DEFAULT_CONNECTION_WAIT_TIMEOUT,
        }
    }

    /// Check the required fields.
    ///
    /// # Errors
    ///
    /// Returns [`SparkError::InvalidOptions`] if the server URL or the project
    /// key is empty.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(SparkError::InvalidOptions("serverUrl is required".into()));
        }
        if self.project_key.trim().is_empty() {
            return Err(SparkError::InvalidOptions("projectKey is required".into()));
        }
        Ok(())
    }

    /// The subset of the configuration handed to a connector.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            server_url: self.server_url.clone(),
            project_key: self.project_key.clone(),
            reconnection: self.reconnection,
            reconnection_attempts: self.reconnection_attempts,
            reconnection_delay: self.reconnection_delay,
        }
    }
}

// ── Environment ─────────────────────────────────────────────────────

/// Values sourced from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub server_url: Option<String>,
    pub project_key: Option<String>,
}

impl EnvConfig {
    /// Read [`SERVER_URL_ENV`] and [`PROJECT_KEY_ENV`] from the process
    /// environment. Empty variables count as unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).filter(|value| !value.is_empty());
        Self {
            server_url: read(SERVER_URL_ENV),
            project_key: read(PROJECT_KEY_ENV),
        }
    }
}

// ── Explicit options ────────────────────────────────────────────────

/// Explicitly supplied options. Unset fields fall back to the environment and
/// then to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparkOptions {
    pub server_url: Option<String>,
    pub project_key: Option<String>,
    pub auto_connect: Option<bool>,
    pub reconnection: Option<bool>,
    pub reconnection_attempts: Option<u32>,
    pub reconnection_delay: Option<Duration>,
    pub debug: Option<bool>,
    pub connect_timeout: Option<Duration>,
    pub ack_timeout: Option<Duration>,
    pub connection_wait_timeout: Option<Duration>,
}

impl SparkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = Some(server_url.into());
        self
    }

    #[must_use]
    pub fn with_project_key(mut self, project_key: impl Into<String>) -> Self {
        self.project_key = Some(project_key.into());
        self
    }

    #[must_use]
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = Some(auto_connect);
        self
    }

    #[must_use]
    pub fn with_reconnection(mut self, reconnection: bool) -> Self {
        self.reconnection = Some(reconnection);
        self
    }

    #[must_use]
    pub fn with_reconnection_attempts(mut self, attempts: u32) -> Self {
        self.reconnection_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn with_reconnection_delay(mut self, delay: Duration) -> Self {
        self.reconnection_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_connection_wait_timeout(mut self, timeout: Duration) -> Self {
        self.connection_wait_timeout = Some(timeout);
        self
    }

    /// Resolve against the process environment and validate.
    ///
    /// # Errors
    ///
    /// Returns [`SparkError::InvalidOptions`] when a required value resolves
    /// to an empty string.
    pub fn resolve(self) -> Result<SparkConfig> {
        self.resolve_with(EnvConfig::from_env())
    }

    /// Resolve against the given environment values and validate.
    ///
    /// # Errors
    ///
    /// Returns [`SparkError::InvalidOptions`] when a required value resolves
    /// to an empty string.
    pub fn resolve_with(self, env: EnvConfig) -> Result<SparkConfig> {
        let server_url = self
            .server_url
            .or(env.server_url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_owned());
        let project_key = self
            .project_key
            .or(env.project_key)
            .unwrap_or_else(|| DEFAULT_PROJECT_KEY.to_owned());

        let defaults = SparkConfig::new(server_url, project_key);
        let config = SparkConfig {
            auto_connect: self.auto_connect.unwrap_or(defaults.auto_connect),
            reconnection: self.reconnection.unwrap_or(defaults.reconnection),
            reconnection_attempts: self
                .reconnection_attempts
                .unwrap_or(defaults.reconnection_attempts),
            reconnection_delay: self
                .reconnection_delay
                .unwrap_or(defaults.reconnection_delay),
            debug: self.debug.unwrap_or(defaults.debug),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            ack_timeout: self.ack_timeout.unwrap_or(defaults.ack_timeout),
            connection_wait_timeout: self
                .connection_wait_timeout
                .unwrap_or(defaults.connection_wait_timeout),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<SparkConfig> for SparkOptions {
    fn from(config: SparkConfig) -> Self {
        Self {
            server_url: Some(config.server_url),
            project_key: Some(config.project_key),
            auto_connect: Some(config.auto_connect),
            reconnection: Some(config.reconnection),
            reconnection_attempts: Some(config.reconnection_attempts),
            reconnection_delay: Some(config.reconnection_delay),
            debug: Some(config.debug),
            connect_timeout: Some(config.connect_timeout),
            ack_timeout: Some(config.ack_timeout),
            connection_wait_timeout: Some(config.connection_wait_timeout),
        }
    }
}
