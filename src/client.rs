//! The [`SparkMessaging`] client facade.
//!
//! [`SparkMessaging`] is a cheap, cloneable handle that composes the
//! connection manager, the message channel and the room manager behind one
//! API. Callbacks may be registered before a connection exists; they are
//! queued and replayed, in registration order, as soon as `connect()`
//! succeeds and before any inbound event is delivered.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), spark_messaging_client::SparkError> {
//! use spark_messaging_client::{MessageKind, SparkMessaging, SparkOptions};
//!
//! let client = SparkMessaging::new(
//!     SparkOptions::new()
//!         .with_server_url("http://localhost:3000")
//!         .with_project_key("pk_live_123")
//!         .with_auto_connect(false),
//! )?;
//!
//! let _messages = client.on_message(|msg| println!("{}: {}", msg.sender.as_deref().unwrap_or("?"), msg.content));
//! client.connect().await?;
//! client.join_room("lobby").await?;
//! client.send_room_message("lobby", MessageKind::Chat, "hello", Some("alice"))?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::config::{SparkConfig, SparkOptions};
use crate::connection::{ConnectionManager, ConnectionState, SocketHandle};
use crate::error::{Result, SparkError};
use crate::error_channel::{ErrorChannel, ErrorRecord};
use crate::messages::{MessageChannel, MessageRegistries};
use crate::protocol::{ConnectedData, ConnectionData, ConnectionStatus, Message, MessageKind};
use crate::rooms::RoomManager;
use crate::subscription::{dispatch, invoke_all, lock, Callback, Registry, Subscription};
use crate::transport::Connector;

/// Message handed to `on_connected` callbacks fired by the client itself.
const CONNECTED_MESSAGE: &str = "Connected to server";

// ── Session ─────────────────────────────────────────────────────────

/// Registrations made while no message channel is bound.
#[derive(Default)]
struct PendingQueues {
    messages: Registry<Message>,
    room_messages: Registry<Message>,
    connected: Registry<ConnectedData>,
}

struct BoundSession {
    channel: Arc<MessageChannel>,
    rooms: Arc<RoomManager>,
}

enum Session {
    /// No live connection. `was_bound` is set once the client has been
    /// connected, so later calls report `NotConnected` instead of
    /// `NotInitialized`.
    Unbound {
        pending: PendingQueues,
        was_bound: bool,
    },
    Bound(BoundSession),
}

impl Session {
    fn fresh() -> Self {
        Session::Unbound {
            pending: PendingQueues::default(),
            was_bound: false,
        }
    }

    /// Error for operations that need a live connection.
    fn unavailable(&self) -> SparkError {
        match self {
            Session::Unbound { was_bound: false, .. } => SparkError::NotInitialized,
            _ => SparkError::NotConnected,
        }
    }
}

/// One dual-mode callback stream: where its registrations live while
/// unbound, and where they live once bound.
trait Stream: 'static {
    type Item: 'static;
    fn pending(queues: &mut PendingQueues) -> &mut Registry<Self::Item>;
    fn live(registries: &MessageRegistries) -> &Arc<Mutex<Registry<Self::Item>>>;
}

struct Messages;
struct RoomMessages;
struct Connected;

impl Stream for Messages {
    type Item = Message;
    fn pending(queues: &mut PendingQueues) -> &mut Registry<Message> {
        &mut queues.messages
    }
    fn live(registries: &MessageRegistries) -> &Arc<Mutex<Registry<Message>>> {
        &registries.messages
    }
}

impl Stream for RoomMessages {
    type Item = Message;
    fn pending(queues: &mut PendingQueues) -> &mut Registry<Message> {
        &mut queues.room_messages
    }
    fn live(registries: &MessageRegistries) -> &Arc<Mutex<Registry<Message>>> {
        &registries.room_messages
    }
}

impl Stream for Connected {
    type Item = ConnectedData;
    fn pending(queues: &mut PendingQueues) -> &mut Registry<ConnectedData> {
        &mut queues.connected
    }
    fn live(registries: &MessageRegistries) -> &Arc<Mutex<Registry<ConnectedData>>> {
        &registries.connected
    }
}

fn adopt_all<T: ?Sized>(pending: &mut Registry<T>, live: &Mutex<Registry<T>>) {
    let mut live = lock(live);
    for (id, callback) in pending.drain() {
        live.adopt(id, callback);
    }
}

// ── Client ──────────────────────────────────────────────────────────

struct Inner {
    config: SparkConfig,
    connection: ConnectionManager,
    errors: ErrorChannel,
    session: Mutex<Session>,
    state_changes: Arc<Mutex<Registry<bool>>>,
    room_joined: Arc<Mutex<Registry<str>>>,
    room_left: Arc<Mutex<Registry<str>>>,
}

/// Client for the Spark Messaging service.
///
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct SparkMessaging {
    inner: Arc<Inner>,
}

impl SparkMessaging {
    /// Create a client that connects over WebSocket.
    ///
    /// Unset options fall back to the `SERVER_URL` / `PROJECT_KEY`
    /// environment variables and then to built-in defaults. With
    /// `auto_connect` (the default) a background connect is started
    /// immediately; its failure is reported on the error channel as
    /// `AUTO_CONNECT_FAILED`, never returned from here.
    ///
    /// # Errors
    ///
    /// Returns [`SparkError::InvalidOptions`] if the server URL or project key
    /// resolves to an empty value, or if `auto_connect` is set outside a
    /// Tokio runtime.
    #[cfg(feature = "transport-websocket")]
    pub fn new(options: SparkOptions) -> Result<Self> {
        Self::with_connector(options, crate::transports::WebSocketConnector::new())
    }

    /// Shorthand for [`new`](Self::new) with just an endpoint and a key.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    #[cfg(feature = "transport-websocket")]
    pub fn with_credentials(
        server_url: impl Into<String>,
        project_key: impl Into<String>,
    ) -> Result<Self> {
        Self::new(
            SparkOptions::new()
                .with_server_url(server_url)
                .with_project_key(project_key),
        )
    }

    /// Create a client that opens transports through `connector`.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_connector(options: SparkOptions, connector: impl Connector) -> Result<Self> {
        Self::from_config(options.resolve()?, Arc::new(connector))
    }

    /// Create a client from an already resolved configuration. The
    /// environment is not consulted.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn from_config(config: SparkConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let runtime = if config.auto_connect {
            let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                SparkError::InvalidOptions("autoConnect requires a running Tokio runtime".into())
            })?;
            Some(handle)
        } else {
            None
        };

        let errors = ErrorChannel::new();
        let connection = ConnectionManager::new(&config, connector, errors.clone());
        let client = Self {
            inner: Arc::new(Inner {
                config,
                connection,
                errors,
                session: Mutex::new(Session::fresh()),
                state_changes: Arc::default(),
                room_joined: Arc::default(),
                room_left: Arc::default(),
            }),
        };

        if let Some(runtime) = runtime {
            let background = client.clone();
            runtime.spawn(async move { background.auto_connect().await });
        }
        Ok(client)
    }

    async fn auto_connect(&self) {
        self.lifecycle("auto-connecting");
        match self.connect().await {
            // An explicit connect() got there first.
            Ok(()) | Err(SparkError::ConnectionInProgress) => {}
            Err(err) => self.inner.errors.report(
                SparkError::AutoConnectFailed(format!("Auto-connect failed: {err}"))
                    .to_record()
                    .with_details(json!({ "cause": err.code().as_str() })),
            ),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Connect to the server and bind the message and room handlers.
    ///
    /// Callbacks registered before this call are moved onto the live
    /// connection in registration order, pending `on_connected` callbacks
    /// fire once, and connection-state subscribers are told `true`.
    /// Returns immediately if already connected.
    ///
    /// # Errors
    ///
    /// - [`SparkError::ConnectionInProgress`] if another connect is running
    /// - [`SparkError::ConnectionError`] if the server rejects the handshake
    /// - [`SparkError::ConnectionTimeout`] if the handshake does not finish in time
    /// - [`SparkError::ConnectionFailed`] if the attempt was aborted by `disconnect()`
    pub async fn connect(&self) -> Result<()> {
        if self.connection_data().is_some() {
            self.lifecycle("already connected");
            return Ok(());
        }
        self.lifecycle("connecting");
        let socket = self.inner.connection.connect().await?;
        self.bind(socket)
    }

    fn bind(&self, socket: SocketHandle) -> Result<()> {
        let (channel, replay) = {
            let mut session = lock(&self.inner.session);
            if let Session::Bound(bound) = &*session {
                if bound.channel.socket().same_socket(&socket) {
                    return Ok(());
                }
            }
            if !socket.is_connected() {
                return Err(SparkError::ConnectionFailed(
                    "connection closed before handlers were bound".into(),
                ));
            }

            let channel = Arc::new(MessageChannel::new(socket.clone()));
            let rooms = Arc::new(RoomManager::new(socket, self.inner.config.ack_timeout));
            let previous = std::mem::replace(
                &mut *session,
                Session::Bound(BoundSession {
                    channel: Arc::clone(&channel),
                    rooms,
                }),
            );

            let mut replay = Vec::new();
            if let Session::Unbound { mut pending, .. } = previous {
                let registries = channel.registries();
                adopt_all(&mut pending.messages, &registries.messages);
                adopt_all(&mut pending.room_messages, &registries.room_messages);
                let mut connected = lock(&registries.connected);
                for (id, callback) in pending.connected.drain() {
                    replay.push(Arc::clone(&callback));
                    connected.adopt(id, callback);
                }
            }
            (channel, replay)
        };

        channel.listen();
        let data = ConnectedData {
            message: CONNECTED_MESSAGE.to_owned(),
            socket_id: channel.socket_id().to_owned(),
            connected_at: Some(channel.bound_at()),
        };
        invoke_all("connected", &replay, &data);
        dispatch("connection-state", &self.inner.state_changes, &true);
        self.lifecycle(&format!("connected, socket id {}", data.socket_id));
        Ok(())
    }

    /// Disconnect and forget all connection-scoped state.
    ///
    /// Clears room membership, message and `on_connected` callbacks (live and
    /// pending) and error subscribers. Connection-state and room
    /// subscribers are kept, and are told `false` if the client was
    /// connected.
    pub fn disconnect(&self) {
        self.lifecycle("disconnecting");
        let was_connected = self.connection_data().is_some();

        self.inner.connection.disconnect();
        let previous = std::mem::replace(
            &mut *lock(&self.inner.session),
            Session::Unbound {
                pending: PendingQueues::default(),
                was_bound: true,
            },
        );
        if let Session::Bound(bound) = previous {
            bound.rooms.clear();
            bound.channel.clear();
        }
        self.inner.errors.clear();

        if was_connected {
            dispatch("connection-state", &self.inner.state_changes, &false);
        }
        self.lifecycle("disconnected");
    }

    /// Wait until the client is connected, starting a connect if none is
    /// running.
    ///
    /// # Errors
    ///
    /// - [`SparkError::ConnectionTimeout`] if no connection is established
    ///   within `connection_wait_timeout`
    /// - any error returned by [`connect`](Self::connect) other than
    ///   [`SparkError::ConnectionInProgress`]; when another connect is
    ///   already running, the error that attempt fails with
    pub async fn wait_for_connection(&self) -> Result<ConnectionData> {
        if let Some(data) = self.connection_data() {
            return Ok(data);
        }

        let (tx, mut rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let subscription = self.on_connected(move |data| {
            if let Some(tx) = lock(&slot).take() {
                let _ = tx.send(data.clone());
            }
        });

        // Subscribed before connecting so a running attempt cannot settle unseen.
        let mut attempts = self.inner.connection.attempts();
        let waited = tokio::time::timeout(self.inner.config.connection_wait_timeout, async {
            match self.connect().await {
                Ok(()) => return self.connection_data().ok_or(SparkError::NotConnected),
                Err(SparkError::ConnectionInProgress) => {}
                Err(err) => return Err(err),
            }
            let connected = loop {
                tokio::select! {
                    data = &mut rx => break data,
                    outcome = attempts.recv() => match outcome {
                        Ok(Err(err)) => return Err(err),
                        Ok(Ok(())) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break (&mut rx).await,
                    },
                }
            };
            match connected {
                Ok(data) => Ok(ConnectionData {
                    socket_id: data.socket_id,
                    connected_at: data
                        .connected_at
                        .unwrap_or_else(std::time::SystemTime::now),
                }),
                // The registration was dropped by a disconnect or a rebind.
                Err(_) => self.connection_data().ok_or_else(|| {
                    SparkError::ConnectionFailed("connection closed while waiting".into())
                }),
            }
        })
        .await;

        subscription.unsubscribe();
        waited.unwrap_or(Err(SparkError::ConnectionTimeout))
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Send a point-to-point message.
    ///
    /// # Errors
    ///
    /// - [`SparkError::NotInitialized`] before the first successful connect
    /// - [`SparkError::NotConnected`] after `disconnect()` or once the
    ///   connection has gone away
    /// - [`SparkError::SendMessageFailed`] if the transport stopped taking frames
    pub fn send_message(&self, kind: MessageKind, content: &str, sender: Option<&str>) -> Result<()> {
        let channel = self.live_channel()?;
        channel
            .send(kind, content, sender)
            .map_err(|err| match err {
                SparkError::NotConnected => err,
                other => SparkError::SendMessageFailed(other.to_string()),
            })
    }

    /// Send a message to everyone in `room`.
    ///
    /// # Errors
    ///
    /// As [`send_message`](Self::send_message), with
    /// [`SparkError::SendRoomMessageFailed`] for queueing failures.
    pub fn send_room_message(
        &self,
        room: &str,
        kind: MessageKind,
        content: &str,
        sender: Option<&str>,
    ) -> Result<()> {
        let channel = self.live_channel()?;
        channel
            .send_to_room(room, kind, content, sender)
            .map_err(|err| match err {
                SparkError::NotConnected => err,
                other => SparkError::SendRoomMessageFailed(other.to_string()),
            })
    }

    /// Register for point-to-point messages. May be called before connecting.
    pub fn on_message(&self, callback: impl Fn(&Message) + Send + Sync + 'static) -> Subscription {
        self.register::<Messages>(Arc::new(callback))
    }

    /// Register for room messages. May be called before connecting.
    pub fn on_room_message(
        &self,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Subscription {
        self.register::<RoomMessages>(Arc::new(callback))
    }

    /// Register for connection notifications.
    ///
    /// If the client is already connected the callback also fires once right
    /// away.
    pub fn on_connected(
        &self,
        callback: impl Fn(&ConnectedData) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: Callback<ConnectedData> = Arc::new(callback);
        if let Some(data) = self.connection_data() {
            let now = ConnectedData {
                message: CONNECTED_MESSAGE.to_owned(),
                socket_id: data.socket_id,
                connected_at: Some(data.connected_at),
            };
            invoke_all("connected", std::slice::from_ref(&callback), &now);
        }
        self.register::<Connected>(callback)
    }

    /// Insert into whichever store currently holds `S` registrations and
    /// return a handle that removes from whichever store holds it later.
    fn register<S: Stream>(&self, callback: Callback<S::Item>) -> Subscription {
        let id = match &mut *lock(&self.inner.session) {
            Session::Unbound { pending, .. } => S::pending(pending).insert(callback),
            Session::Bound(bound) => lock(S::live(bound.channel.registries())).insert(callback),
        };

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(id, move |id| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match &mut *lock(&inner.session) {
                Session::Unbound { pending, .. } => {
                    S::pending(pending).remove(id);
                }
                Session::Bound(bound) => {
                    lock(S::live(bound.channel.registries())).remove(id);
                }
            };
        })
    }

    // ── Rooms ───────────────────────────────────────────────────────

    /// Join `room`. Joining a room already joined is a no-op.
    ///
    /// Room-joined subscribers are notified only when membership changed.
    ///
    /// # Errors
    ///
    /// - [`SparkError::NotInitialized`] before the first successful connect
    /// - [`SparkError::NotConnected`] after `disconnect()` or once the
    ///   connection has gone away
    /// - [`SparkError::JoinRoomFailed`] if the server rejects the join
    /// - [`SparkError::AckTimeout`] if the server does not answer in time
    pub async fn join_room(&self, room: &str) -> Result<()> {
        let rooms = self.rooms()?;
        if rooms.join_room(room).await? {
            self.lifecycle(&format!("joined room {room}"));
            dispatch("room-joined", &self.inner.room_joined, room);
        }
        Ok(())
    }

    /// Leave `room`. Leaving a room that was never joined is a no-op.
    ///
    /// # Errors
    ///
    /// As [`join_room`](Self::join_room), with [`SparkError::LeaveRoomFailed`].
    pub async fn leave_room(&self, room: &str) -> Result<()> {
        let rooms = self.rooms()?;
        if rooms.leave_room(room).await? {
            self.lifecycle(&format!("left room {room}"));
            dispatch("room-left", &self.inner.room_left, room);
        }
        Ok(())
    }

    /// Leave every joined room concurrently. Every leave is attempted;
    /// room-left subscribers hear about each one that succeeded.
    ///
    /// # Errors
    ///
    /// As [`join_room`](Self::join_room) when there is no connection,
    /// otherwise the first failed leave in room order.
    pub async fn leave_all_rooms(&self) -> Result<()> {
        self.rooms()?
            .leave_all_rooms(|room| dispatch("room-left", &self.inner.room_left, room))
            .await
    }

    /// Rooms currently joined, sorted. Empty before the first connect.
    pub fn joined_rooms(&self) -> Vec<String> {
        self.rooms()
            .map(|rooms| rooms.joined_rooms())
            .unwrap_or_default()
    }

    pub fn is_in_room(&self, room: &str) -> bool {
        self.rooms().is_ok_and(|rooms| rooms.is_in_room(room))
    }

    // ── Notifications ───────────────────────────────────────────────

    /// Register for error notifications.
    ///
    /// Error subscribers are cleared by [`disconnect`](Self::disconnect).
    pub fn on_error(&self, callback: impl Fn(&ErrorRecord) + Send + Sync + 'static) -> Subscription {
        self.inner.errors.on_error(callback)
    }

    /// Register for `true` on connect and `false` on disconnect.
    pub fn on_connection_state_change(
        &self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        let id = lock(&self.inner.state_changes).insert(Arc::new(move |connected: &bool| {
            callback(*connected);
        }));
        Subscription::for_registry(id, &self.inner.state_changes)
    }

    pub fn on_room_joined(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        let id = lock(&self.inner.room_joined).insert(Arc::new(callback));
        Subscription::for_registry(id, &self.inner.room_joined)
    }

    pub fn on_room_left(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        let id = lock(&self.inner.room_left).insert(Arc::new(callback));
        Subscription::for_registry(id, &self.inner.room_left)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Returns `true` once `connect()` has bound the handlers, until the
    /// next `disconnect()`.
    pub fn is_initialized(&self) -> bool {
        matches!(&*lock(&self.inner.session), Session::Bound(_))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn socket_id(&self) -> Option<String> {
        self.inner.connection.socket_id()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let connected_at = match &*lock(&self.inner.session) {
            Session::Bound(bound) => Some(bound.channel.bound_at()),
            Session::Unbound { .. } => None,
        };
        ConnectionStatus {
            is_connected: self.is_connected(),
            socket_id: self.socket_id(),
            connected_at,
        }
    }

    /// The resolved configuration.
    pub fn config(&self) -> &SparkConfig {
        &self.inner.config
    }

    // ── Internals ───────────────────────────────────────────────────

    fn connection_data(&self) -> Option<ConnectionData> {
        match &*lock(&self.inner.session) {
            Session::Bound(bound) if bound.channel.is_connected() => Some(ConnectionData {
                socket_id: bound.channel.socket_id().to_owned(),
                connected_at: bound.channel.bound_at(),
            }),
            _ => None,
        }
    }

    fn live_channel(&self) -> Result<Arc<MessageChannel>> {
        let channel = match &*lock(&self.inner.session) {
            Session::Bound(bound) => Arc::clone(&bound.channel),
            unbound => return Err(unbound.unavailable()),
        };
        if channel.is_connected() {
            Ok(channel)
        } else {
            Err(SparkError::NotConnected)
        }
    }

    fn rooms(&self) -> Result<Arc<RoomManager>> {
        match &*lock(&self.inner.session) {
            Session::Bound(bound) => Ok(Arc::clone(&bound.rooms)),
            unbound => Err(unbound.unavailable()),
        }
    }

    fn lifecycle(&self, message: &str) {
        if self.inner.config.debug {
            info!("[SparkMessaging] {message}");
        } else {
            debug!("{message}");
        }
    }
}

impl fmt::Debug for SparkMessaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparkMessaging")
            .field("server_url", &self.inner.config.server_url)
            .field("state", &self.state())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
