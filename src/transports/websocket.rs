//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! This module provides [`WebSocketTransport`], a [`Transport`] implementation
//! that exchanges protocol frames as WebSocket text messages, and
//! [`WebSocketConnector`], the default [`Connector`] used by
//! [`SparkMessaging::new`](crate::SparkMessaging::new).
//!
//! Both `ws://` and `wss://` URLs are supported, and `http(s)://` server URLs
//! are mapped to their WebSocket equivalent. TLS is handled by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), spark_messaging_client::SparkError> {
//! use spark_messaging_client::{Transport, WebSocketTransport};
//!
//! let mut transport = WebSocketTransport::connect("ws://localhost:3000/?key=pk").await?;
//! transport.send(r#"{"event":"handshake","data":{"auth":{"key":"pk"}}}"#.to_string()).await?;
//!
//! if let Some(Ok(frame)) = transport.recv().await {
//!     println!("received: {frame}");
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::error::SparkError;
use crate::transport::{ConnectOptions, Connector, Transport};

/// Type alias for the underlying WebSocket stream.
///
/// Made public so that callers can construct a [`WebSocketTransport`] from an
/// existing stream via [`WebSocketTransport::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
///
/// For advanced use-cases (custom TLS, proxy, headers) construct the stream
/// yourself and use [`WebSocketTransport::from_stream`].
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe. Dropping its future before it
/// completes does not consume or lose a frame.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Establish a new WebSocket connection to the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`SparkError::Io`] if the URL is invalid or the connection
    /// cannot be established. An underlying I/O error keeps its
    /// [`ErrorKind`](std::io::ErrorKind); anything else maps to
    /// [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, SparkError> {
        let shown = Url::parse(url).map_or_else(|_| "<unparsed>".to_owned(), |u| redacted(&u).to_string());
        tracing::debug!(url = %shown, "dialing WebSocket server");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            SparkError::from(std::io::Error::new(kind, e))
        })?;

        tracing::debug!(url = %shown, "WebSocket connection established");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established WebSocket stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<(), SparkError> {
        if self.closed {
            return Err(SparkError::TransportClosed);
        }
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| SparkError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SparkError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Some(Err(SparkError::TransportReceive(e.to_string()))),
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => tracing::debug!("received raw WebSocket frame, skipping"),
            }
        }
    }

    async fn close(&mut self) -> Result<(), SparkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| SparkError::TransportSend(e.to_string()))
    }
}

/// Dials [`WebSocketTransport`]s, retrying failed dials according to the
/// reconnection fields of [`ConnectOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, options: &ConnectOptions) -> Result<Box<dyn Transport>, SparkError> {
        let url = endpoint_url(&options.server_url, &options.project_key)?;
        let retries = if options.reconnection {
            options.reconnection_attempts
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            match WebSocketTransport::connect(url.as_str()).await {
                Ok(transport) => return Ok(Box::new(transport)),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    tracing::warn!(attempt, retries, "dial failed, retrying: {e}");
                    tokio::time::sleep(options.reconnection_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Map a server URL to its WebSocket endpoint and attach the `key` query
/// parameter.
///
/// `http` maps to `ws` and `https` to `wss`. A URL without a scheme is
/// treated as `ws://`. Fragments are dropped since they are never sent.
///
/// # Errors
///
/// Returns [`SparkError::InvalidOptions`] if `server_url` does not parse.
pub fn endpoint_url(server_url: &str, project_key: &str) -> Result<Url, SparkError> {
    let trimmed = server_url.trim();
    // Without `://`, `host:port` would parse with `host` as the scheme.
    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("ws://{trimmed}"))
    };
    let mut url = parsed
        .map_err(|e| SparkError::InvalidOptions(format!("invalid server URL {trimmed:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
        return Err(SparkError::InvalidOptions(format!(
            "unsupported scheme in server URL {trimmed:?}"
        )));
    }

    let scheme = match url.scheme() {
        "https" => Some("wss"),
        "http" => Some("ws"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme).map_err(|()| {
            SparkError::InvalidOptions(format!("cannot map {trimmed:?} to {scheme}://"))
        })?;
    }
    url.set_fragment(None);
    url.query_pairs_mut().append_pair("key", project_key);
    Ok(url)
}

/// `url` with any `key` query parameter removed, for logging.
fn redacted(url: &Url) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != "key")
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    let mut shown = url.clone();
    if kept.is_empty() {
        shown.set_query(None);
    } else {
        shown.query_pairs_mut().clear().extend_pairs(kept);
    }
    shown
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    fn endpoint(server_url: &str, key: &str) -> String {
        endpoint_url(server_url, key).unwrap().to_string()
    }

    #[test]
    fn endpoint_url_maps_scheme_and_appends_key() {
        assert_eq!(endpoint("http://localhost:3000", "pk"), "ws://localhost:3000/?key=pk");
        assert_eq!(
            endpoint("https://chat.example.com/ws", "pk"),
            "wss://chat.example.com/ws?key=pk"
        );
        assert_eq!(
            endpoint("ws://host/?room=a", "a b&c"),
            "ws://host/?room=a&key=a+b%26c"
        );
        assert_eq!(endpoint("host:1", "k"), "ws://host:1/?key=k");
        assert_eq!(endpoint("  wss://secure.example.com  ", "k"), "wss://secure.example.com/?key=k");
    }

    #[test]
    fn endpoint_url_normalises_case_and_drops_fragment() {
        assert_eq!(endpoint("HTTP://Host:3000", "pk"), "ws://host:3000/?key=pk");
        assert_eq!(endpoint("HTTPS://Host", "pk"), "wss://host/?key=pk");
        assert_eq!(
            endpoint("http://host:3000/chat#top", "pk"),
            "ws://host:3000/chat?key=pk"
        );
    }

    #[test]
    fn endpoint_url_rejects_bad_urls() {
        for url in ["http://exa mple.com", "ftp://files.example.com", "http://[::1"] {
            let err = endpoint_url(url, "pk").unwrap_err();
            assert!(matches!(err, SparkError::InvalidOptions(_)), "accepted {url}");
        }
    }

    #[test]
    fn redacted_url_hides_credential() {
        let url = endpoint_url("http://h/?room=a", "secret").unwrap();
        assert_eq!(redacted(&url).as_str(), "ws://h/?room=a");
        let bare = endpoint_url("http://h", "secret").unwrap();
        assert_eq!(redacted(&bare).as_str(), "ws://h/");
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url").await.unwrap_err();
        assert!(matches!(err, SparkError::Io(_)));
    }

    #[tokio::test]
    async fn connector_without_reconnection_fails_once() {
        let options = ConnectOptions {
            server_url: "ws://127.0.0.1:1".into(),
            project_key: "pk".into(),
            reconnection: false,
            reconnection_attempts: 5,
            reconnection_delay: Duration::from_secs(60),
        };
        let err = WebSocketConnector::new().open(&options).await.err().unwrap();
        assert!(matches!(err, SparkError::Io(_)));
    }

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns its address.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn recv_skips_binary_frames() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into())).await.unwrap();
            ws.send(Message::Text("after_binary".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "after_binary");
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("oops".to_string()).await.unwrap_err();
        assert!(matches!(err, SparkError::TransportClosed));
    }

    #[tokio::test]
    async fn connector_dials_http_url_with_key() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut path = None;
            let ws = tokio_tungstenite::accept_hdr_async(
                tcp,
                |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    path = Some(req.uri().to_string());
                    Ok(resp)
                },
            )
            .await
            .unwrap();
            seen_tx.send(path).unwrap();
            drop(ws);
        });

        let options = ConnectOptions {
            server_url: format!("http://{addr}"),
            project_key: "pk 1".into(),
            reconnection: true,
            reconnection_attempts: 0,
            reconnection_delay: Duration::from_millis(10),
        };
        let _transport = WebSocketConnector::new().open(&options).await.unwrap();
        let path = seen_rx.await.unwrap().unwrap();
        assert!(path.ends_with("?key=pk+1"), "unexpected request uri {path}");
    }
}
