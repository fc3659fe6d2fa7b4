//! Connection lifecycle and the background transport loop.
//!
//! [`ConnectionManager`] owns at most one live connection. A successful
//! [`connect`](ConnectionManager::connect) opens a transport through the
//! configured [`Connector`], performs the handshake, spawns a transport loop
//! task and hands back a [`SocketHandle`]: the cloneable handle through which
//! the message channel and room manager emit frames and receive inbound
//! events.
//!
//! Inbound application events are buffered inside the socket until a listener
//! is [attached](SocketHandle::attach), so nothing received between the
//! handshake and the binding of handlers is lost.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SparkConfig;
use crate::error::{Result, SparkError};
use crate::error_channel::ErrorChannel;
use crate::protocol::{
    AckPayload, AuthPayload, ClientEvent, ConnectedPayload, Message, ServerEvent,
    SERVER_DISCONNECT_REASON,
};
use crate::subscription::lock;
use crate::transport::{ConnectOptions, Connector, Transport};

/// Time the transport loop grants `Transport::close` before giving up.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Observable state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

// ── Inbound events ──────────────────────────────────────────────────

/// Application events forwarded from the transport loop to a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Connected(ConnectedPayload),
    Message(Message),
    RoomMessage(Message),
}

/// Receives inbound events from a [`SocketHandle`].
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: &InboundEvent);
}

enum Inbound {
    Buffering(Vec<InboundEvent>),
    Attached(Arc<dyn EventListener>),
}

// ── Socket handle ───────────────────────────────────────────────────

enum Command {
    Emit(ClientEvent),
    Request {
        event: ClientEvent,
        id: u64,
        reply: oneshot::Sender<AckPayload>,
    },
}

struct SocketShared {
    id: String,
    connected: AtomicBool,
    next_ack: AtomicU64,
    inbound: Mutex<Inbound>,
}

impl SocketShared {
    fn deliver(&self, event: InboundEvent) {
        // Dispatch happens under the slot lock so that `attach` cannot
        // interleave a buffered flush with a newer event.
        let mut slot = lock(&self.inbound);
        match &mut *slot {
            Inbound::Buffering(buffer) => buffer.push(event),
            Inbound::Attached(listener) => listener.on_event(&event),
        }
    }
}

/// Cloneable handle to a live connection.
#[derive(Clone)]
pub struct SocketHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<SocketShared>,
}

impl SocketHandle {
    /// Socket id assigned at handshake.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Returns `true` if both handles refer to the same connection.
    pub fn same_socket(&self, other: &SocketHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Returns `true` until the transport loop exits.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Queue a fire-and-forget frame.
    ///
    /// # Errors
    ///
    /// - [`SparkError::NotConnected`] if the connection is gone
    /// - [`SparkError::TransportClosed`] if the transport loop already exited
    pub fn emit(&self, event: ClientEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(SparkError::NotConnected);
        }
        self.cmd_tx
            .send(Command::Emit(event))
            .map_err(|_| SparkError::TransportClosed)
    }

    /// Queue a frame that expects one acknowledgement.
    ///
    /// `build` receives the ack id to embed in the frame. The returned
    /// receiver resolves with the matching [`AckPayload`], or fails if the
    /// connection ends first.
    ///
    /// # Errors
    ///
    /// As [`emit`](Self::emit).
    pub fn request(
        &self,
        build: impl FnOnce(u64) -> ClientEvent,
    ) -> Result<oneshot::Receiver<AckPayload>> {
        if !self.is_connected() {
            return Err(SparkError::NotConnected);
        }
        let id = self.shared.next_ack.fetch_add(1, Ordering::Relaxed);
        let (reply, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                event: build(id),
                id,
                reply,
            })
            .map_err(|_| SparkError::TransportClosed)?;
        Ok(ack_rx)
    }

    /// Start delivering inbound events to `listener`, flushing anything
    /// buffered since the handshake first, in arrival order.
    pub fn attach(&self, listener: Arc<dyn EventListener>) {
        let mut slot = lock(&self.shared.inbound);
        if let Inbound::Buffering(buffer) = &mut *slot {
            for event in buffer.drain(..) {
                listener.on_event(&event);
            }
        }
        *slot = Inbound::Attached(listener);
    }
}

/// Server side of a socket with no transport loop, for unit tests.
#[cfg(test)]
pub(crate) struct Loopback {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<SocketShared>,
}

#[cfg(test)]
impl Loopback {
    pub(crate) fn socket(id: &str) -> (SocketHandle, Self) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SocketShared {
            id: id.to_owned(),
            connected: AtomicBool::new(true),
            next_ack: AtomicU64::new(1),
            inbound: Mutex::new(Inbound::Buffering(Vec::new())),
        });
        let socket = SocketHandle {
            cmd_tx,
            shared: Arc::clone(&shared),
        };
        (socket, Self { cmd_rx, shared })
    }

    pub(crate) fn deliver(&self, event: InboundEvent) {
        self.shared.deliver(event);
    }

    /// Next frame the client emitted, with the reply slot for requests.
    pub(crate) async fn next(&mut self) -> Option<(ClientEvent, Option<oneshot::Sender<AckPayload>>)> {
        match self.cmd_rx.recv().await? {
            Command::Emit(event) => Some((event, None)),
            Command::Request { event, reply, .. } => Some((event, Some(reply))),
        }
    }

    pub(crate) fn try_next(&mut self) -> Option<ClientEvent> {
        match self.cmd_rx.try_recv().ok()? {
            Command::Emit(event) | Command::Request { event, .. } => Some(event),
        }
    }

    pub(crate) fn drop_connection(&self) {
        self.shared.connected.store(false, Ordering::Release);
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.shared.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ── Connection manager ──────────────────────────────────────────────

struct Live {
    socket: SocketHandle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

enum Phase {
    Disconnected,
    Connecting,
    Connected(Live),
}

struct ManagerState {
    phase: Phase,
    /// Bumped by every connect attempt and every disconnect so that stale
    /// attempts and stale transport loops can recognise themselves.
    generation: u64,
}

impl ManagerState {
    fn mark_disconnected(&mut self, generation: u64) {
        if self.generation == generation {
            self.phase = Phase::Disconnected;
        }
    }
}

/// Resets a `Connecting` phase left behind by a failed or dropped attempt
/// and announces how the attempt ended.
struct Attempt<'a> {
    state: &'a Mutex<ManagerState>,
    generation: u64,
    settled: &'a broadcast::Sender<Result<()>>,
    outcome: Option<Result<()>>,
}

impl Attempt<'_> {
    fn finish(&mut self, result: &Result<SocketHandle>) {
        self.outcome = Some(result.as_ref().map(|_| ()).map_err(Clone::clone));
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        {
            let mut state = lock(self.state);
            if state.generation == self.generation && matches!(state.phase, Phase::Connecting) {
                state.phase = Phase::Disconnected;
            }
        }
        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(SparkError::ConnectionFailed(
                "connection attempt abandoned".into(),
            ))
        });
        // Nobody listening is fine.
        let _ = self.settled.send(outcome);
    }
}

/// Owns the transport handle and the Disconnected/Connecting/Connected state.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    connect_timeout: Duration,
    errors: ErrorChannel,
    state: Arc<Mutex<ManagerState>>,
    settled: broadcast::Sender<Result<()>>,
}

impl ConnectionManager {
    pub fn new(config: &SparkConfig, connector: Arc<dyn Connector>, errors: ErrorChannel) -> Self {
        Self {
            connector,
            options: config.connect_options(),
            connect_timeout: config.connect_timeout,
            errors,
            state: Arc::new(Mutex::new(ManagerState {
                phase: Phase::Disconnected,
                generation: 0,
            })),
            settled: broadcast::channel(8).0,
        }
    }

    /// Outcomes of connect attempts that finish after this call, in order.
    ///
    /// Lets a caller turned away with
    /// [`SparkError::ConnectionInProgress`] learn how the running attempt
    /// ended.
    pub fn attempts(&self) -> broadcast::Receiver<Result<()>> {
        self.settled.subscribe()
    }

    /// Connect, or return the live socket if already connected.
    ///
    /// Handshake failures are also reported to the error channel.
    ///
    /// # Errors
    ///
    /// - [`SparkError::ConnectionInProgress`] if another attempt is running
    /// - [`SparkError::ConnectionError`] if the dial or the handshake fails
    /// - [`SparkError::ConnectionTimeout`] if the handshake does not finish in time
    /// - [`SparkError::ConnectionFailed`] if `disconnect()` aborted the attempt
    pub async fn connect(&self) -> Result<SocketHandle> {
        let generation = {
            let mut state = lock(&self.state);
            match &state.phase {
                Phase::Connected(live) if live.socket.is_connected() => {
                    return Ok(live.socket.clone());
                }
                Phase::Connecting => return Err(SparkError::ConnectionInProgress),
                _ => {}
            }
            state.generation += 1;
            state.phase = Phase::Connecting;
            state.generation
        };
        let mut attempt = Attempt {
            state: &self.state,
            generation,
            settled: &self.settled,
            outcome: None,
        };
        let result = self.establish(generation).await;
        attempt.finish(&result);
        result
    }

    async fn establish(&self, generation: u64) -> Result<SocketHandle> {
        debug!(url = %self.options.server_url, "connecting");

        let handshake = tokio::time::timeout(self.connect_timeout, self.handshake()).await;
        let (transport, socket_id) = match handshake {
            Ok(Ok(established)) => established,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                let err = SparkError::ConnectionTimeout;
                self.errors.report(&err);
                return Err(err);
            }
        };

        let installed = {
            let mut state = lock(&self.state);
            if state.generation == generation {
                let (socket, live) =
                    spawn_transport_loop(transport, socket_id, &self.state, generation, &self.errors);
                state.phase = Phase::Connected(live);
                Ok(socket)
            } else {
                Err(transport)
            }
        };

        match installed {
            Ok(socket) => {
                info!(socket_id = %socket.id(), "connected");
                Ok(socket)
            }
            Err(mut transport) => {
                debug!("connect attempt superseded by disconnect, closing transport");
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                Err(SparkError::ConnectionFailed(
                    "connection attempt aborted by disconnect".into(),
                ))
            }
        }
    }

    /// Run the handshake, normalising and reporting any failure as a
    /// connection error.
    async fn handshake(&self) -> Result<(Box<dyn Transport>, String)> {
        self.open_and_greet().await.map_err(|err| {
            let err = match err {
                SparkError::ConnectionError(_) => err,
                other => SparkError::ConnectionError(other.to_string()),
            };
            error!("connect failed: {err}");
            self.errors.report(&err);
            err
        })
    }

    /// Open a transport, send the handshake and wait for `connect`.
    async fn open_and_greet(&self) -> Result<(Box<dyn Transport>, String)> {
        let mut transport = self.connector.open(&self.options).await?;
        let hello = serde_json::to_string(&ClientEvent::Handshake {
            auth: AuthPayload {
                key: self.options.project_key.clone(),
            },
        })?;
        transport.send(hello).await?;

        loop {
            match transport.recv().await {
                Some(Ok(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(ServerEvent::Connect { sid }) => {
                        let socket_id = sid.unwrap_or_else(|| Uuid::new_v4().to_string());
                        return Ok((transport, socket_id));
                    }
                    Ok(ServerEvent::ConnectError { message }) => {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                        return Err(SparkError::ConnectionError(non_empty(
                            message,
                            "Connection failed",
                        )));
                    }
                    Ok(other) => {
                        debug!(?other, "ignoring frame received before handshake completed");
                    }
                    Err(e) => warn!("failed to decode handshake frame: {e}, raw: {text}"),
                },
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(SparkError::ConnectionFailed(
                        "transport closed during handshake".into(),
                    ))
                }
            }
        }
    }

    /// Tear down the connection. A no-op when already disconnected.
    ///
    /// An attempt still in its handshake is aborted.
    pub fn disconnect(&self) {
        let previous = {
            let mut state = lock(&self.state);
            state.generation += 1;
            std::mem::replace(&mut state.phase, Phase::Disconnected)
        };
        match previous {
            Phase::Connected(mut live) => {
                debug!(socket_id = %live.socket.id(), "disconnect requested");
                live.socket.shared.connected.store(false, Ordering::Release);
                if let Some(tx) = live.shutdown_tx.take() {
                    let _ = tx.send(());
                }
            }
            Phase::Connecting => debug!("disconnect requested during connect, aborting attempt"),
            Phase::Disconnected => {}
        }
    }

    pub fn state(&self) -> ConnectionState {
        match &lock(&self.state).phase {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting => ConnectionState::Connecting,
            Phase::Connected(live) if live.socket.is_connected() => ConnectionState::Connected,
            Phase::Connected(_) => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The live socket, if connected.
    pub fn socket(&self) -> Option<SocketHandle> {
        match &lock(&self.state).phase {
            Phase::Connected(live) if live.socket.is_connected() => Some(live.socket.clone()),
            _ => None,
        }
    }

    /// Socket id of the live connection, if connected.
    pub fn socket_id(&self) -> Option<String> {
        self.socket().map(|socket| socket.id().to_owned())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("server_url", &self.options.server_url)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // No executor is available to drive a graceful close here.
        if let Phase::Connected(live) = &lock(&self.state).phase {
            live.task.abort();
        }
    }
}

fn non_empty(message: String, fallback: &str) -> String {
    if message.is_empty() {
        fallback.to_owned()
    } else {
        message
    }
}

// ── Transport loop ──────────────────────────────────────────────────

fn spawn_transport_loop(
    transport: Box<dyn Transport>,
    socket_id: String,
    state: &Arc<Mutex<ManagerState>>,
    generation: u64,
    errors: &ErrorChannel,
) -> (SocketHandle, Live) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let shared = Arc::new(SocketShared {
        id: socket_id,
        connected: AtomicBool::new(true),
        next_ack: AtomicU64::new(1),
        inbound: Mutex::new(Inbound::Buffering(Vec::new())),
    });
    let socket = SocketHandle { cmd_tx, shared };

    let task = tokio::spawn(transport_loop(
        transport,
        cmd_rx,
        shutdown_rx,
        Arc::clone(&socket.shared),
        Arc::clone(state),
        generation,
        errors.clone(),
    ));

    let live = Live {
        socket: socket.clone(),
        shutdown_tx: Some(shutdown_tx),
        task,
    };
    (socket, live)
}

enum Flow {
    Continue,
    Stop,
}

/// Multiplexes outbound commands, the shutdown signal and inbound frames.
///
/// Exits when:
/// - `disconnect()` fires the shutdown signal
/// - every socket handle has been dropped
/// - the server sends `disconnect` or closes the transport
/// - a transport error occurs
async fn transport_loop(
    mut transport: Box<dyn Transport>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: oneshot::Receiver<()>,
    socket: Arc<SocketShared>,
    state: Arc<Mutex<ManagerState>>,
    generation: u64,
    errors: ErrorChannel,
) {
    debug!(socket_id = %socket.id, "transport loop started");
    let mut acks: HashMap<u64, oneshot::Sender<AckPayload>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let event = match cmd {
                    Some(Command::Emit(event)) => event,
                    Some(Command::Request { event, id, reply }) => {
                        track_request(&mut acks, id, reply);
                        event
                    }
                    None => {
                        debug!("all socket handles dropped, closing transport");
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                        break;
                    }
                };
                if let Err(e) = send_frame(transport.as_mut(), &event).await {
                    error!("transport send error: {e}");
                    errors.report(&e);
                    break;
                }
            }

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                break;
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if let Flow::Stop = handle_server_event(event, &socket, &mut acks, &errors) {
                                let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                                break;
                            }
                        }
                        Err(e) => warn!("failed to decode server frame: {e}, raw: {text}"),
                    },
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        errors.report(&e);
                        break;
                    }
                    None => {
                        debug!("transport closed by server");
                        break;
                    }
                }
            }
        }
    }

    socket.connected.store(false, Ordering::Release);
    // Dropping the reply senders fails every request still awaiting an ack.
    drop(acks);
    lock(&state).mark_disconnected(generation);
    debug!(socket_id = %socket.id, "transport loop exited");
}

/// Register a reply slot, first pruning slots whose requester stopped
/// waiting (timed out or dropped).
fn track_request(
    acks: &mut HashMap<u64, oneshot::Sender<AckPayload>>,
    id: u64,
    reply: oneshot::Sender<AckPayload>,
) {
    acks.retain(|_, pending| !pending.is_closed());
    acks.insert(id, reply);
}

async fn send_frame(transport: &mut dyn Transport, event: &ClientEvent) -> Result<()> {
    let json = serde_json::to_string(event)?;
    transport.send(json).await
}

fn handle_server_event(
    event: ServerEvent,
    socket: &SocketShared,
    acks: &mut HashMap<u64, oneshot::Sender<AckPayload>>,
    errors: &ErrorChannel,
) -> Flow {
    match event {
        ServerEvent::Connect { .. } => debug!("ignoring repeated connect frame"),
        ServerEvent::ConnectError { message } => errors.report(SparkError::ConnectionError(
            non_empty(message, "Connection failed"),
        )),
        ServerEvent::Error { message, code } => errors.report(SparkError::Socket {
            message: non_empty(message, "Socket error occurred"),
            code,
        }),
        ServerEvent::Disconnect { reason } => {
            if reason == SERVER_DISCONNECT_REASON {
                errors.report(SparkError::ServerDisconnect);
            } else {
                debug!(%reason, "remote disconnect");
            }
            return Flow::Stop;
        }
        ServerEvent::Connected(payload) => socket.deliver(InboundEvent::Connected(payload)),
        ServerEvent::Message(message) => socket.deliver(InboundEvent::Message(message)),
        ServerEvent::RoomMessage(message) => socket.deliver(InboundEvent::RoomMessage(message)),
        ServerEvent::Ack(payload) => match acks.remove(&payload.id) {
            Some(reply) => {
                let _ = reply.send(payload);
            }
            None => debug!(id = payload.id, "acknowledgement for unknown request"),
        },
    }
    Flow::Continue
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
    use crate::error_channel::ErrorRecord;
    use crate::error_codes::ErrorCode;
    use async_trait::async_trait;
    use serde_json::json;

    /// Opens channel-backed transports whose server side is handed to the test.
    struct ChannelConnector {
        servers: mpsc::UnboundedSender<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>)>,
        greeting: Option<String>,
    }

    struct ChannelTransport {
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, frame: String) -> Result<()> {
            self.tx
                .send(frame)
                .map_err(|e| SparkError::TransportSend(e.to_string()))
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<()> {
            self.rx.close();
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for ChannelConnector {
        async fn open(&self, _options: &ConnectOptions) -> Result<Box<dyn Transport>> {
            let (client_tx, server_rx) = mpsc::unbounded_channel();
            let (server_tx, client_rx) = mpsc::unbounded_channel();
            if let Some(greeting) = &self.greeting {
                server_tx.send(greeting.clone()).unwrap();
            }
            self.servers.send((server_rx, server_tx)).unwrap();
            Ok(Box::new(ChannelTransport {
                tx: client_tx,
                rx: client_rx,
            }))
        }
    }

    type ServerEnd = (mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>);

    fn manager(
        greeting: Option<serde_json::Value>,
    ) -> (ConnectionManager, ErrorChannel, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, server_rx) = mpsc::unbounded_channel();
        let connector = ChannelConnector {
            servers,
            greeting: greeting.map(|g| g.to_string()),
        };
        let errors = ErrorChannel::new();
        let config = SparkConfig::new("ws://test", "pk_test");
        let manager = ConnectionManager::new(&config, Arc::new(connector), errors.clone());
        (manager, errors, server_rx)
    }

    fn record_errors(errors: &ErrorChannel) -> Arc<Mutex<Vec<ErrorRecord>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = errors.on_error(move |record| sink.lock().unwrap().push(record.clone()));
        seen
    }

    #[tokio::test]
    async fn connect_sends_handshake_and_uses_server_sid() {
        let (manager, _errors, mut servers) =
            manager(Some(json!({"event": "connect", "data": {"sid": "sock-1"}})));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let socket = manager.connect().await.unwrap();
        assert_eq!(socket.id(), "sock-1");
        assert!(manager.is_connected());
        assert_eq!(manager.socket_id().as_deref(), Some("sock-1"));

        let (mut server_rx, _server_tx) = servers.recv().await.unwrap();
        let hello: serde_json::Value =
            serde_json::from_str(&server_rx.recv().await.unwrap()).unwrap();
        assert_eq!(hello, json!({"event": "handshake", "data": {"auth": {"key": "pk_test"}}}));

        // Connecting again is idempotent and reuses the socket.
        let again = manager.connect().await.unwrap();
        assert_eq!(again.id(), "sock-1");
        assert!(servers.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_sid_gets_generated_id() {
        let (manager, _errors, _servers) =
            manager(Some(json!({"event": "connect", "data": {}})));
        let socket = manager.connect().await.unwrap();
        assert!(Uuid::parse_str(socket.id()).is_ok());
    }

    #[tokio::test]
    async fn connect_error_rejects_and_reports() {
        let (manager, errors, _servers) = manager(Some(
            json!({"event": "connect_error", "data": {"message": "invalid key"}}),
        ));
        let seen = record_errors(&errors);

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionError);
        assert_eq!(err.to_string(), "invalid key");
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].code.as_deref(), Some("CONNECTION_ERROR"));
    }

    #[tokio::test]
    async fn concurrent_connect_is_rejected_while_connecting() {
        // No greeting: the handshake stays pending until the server answers.
        let (manager, _errors, mut servers) = manager(None);

        let (first, second) = tokio::join!(manager.connect(), async {
            tokio::task::yield_now().await;
            let second = manager.connect().await;
            let (_server_rx, server_tx) = servers.recv().await.unwrap();
            server_tx
                .send(json!({"event": "connect", "data": {"sid": "s"}}).to_string())
                .unwrap();
            second
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(SparkError::ConnectionInProgress)));
    }

    #[tokio::test]
    async fn disconnect_during_handshake_aborts_attempt() {
        let (manager, _errors, mut servers) = manager(None);

        let (result, ()) = tokio::join!(manager.connect(), async {
            let (_server_rx, server_tx) = servers.recv().await.unwrap();
            manager.disconnect();
            server_tx
                .send(json!({"event": "connect", "data": {"sid": "late"}}).to_string())
                .unwrap();
        });

        assert!(matches!(result, Err(SparkError::ConnectionFailed(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn dropped_connect_attempt_resets_state() {
        let (manager, _errors, _servers) = manager(None);
        let mut attempts = manager.attempts();
        let result = tokio::time::timeout(Duration::from_millis(20), manager.connect()).await;
        assert!(result.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(
            attempts.try_recv().unwrap(),
            Err(SparkError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn attempt_outcomes_are_announced_in_order() {
        let (manager, _errors, mut servers) = manager(None);
        let mut attempts = manager.attempts();

        let (failed, ()) = tokio::join!(manager.connect(), async {
            let (_server_rx, server_tx) = servers.recv().await.unwrap();
            server_tx
                .send(json!({"event": "connect_error", "data": {"message": "bad key"}}).to_string())
                .unwrap();
        });
        assert!(failed.is_err());

        let (connected, _server) = tokio::join!(manager.connect(), async {
            let (server_rx, server_tx) = servers.recv().await.unwrap();
            server_tx
                .send(json!({"event": "connect", "data": {"sid": "s"}}).to_string())
                .unwrap();
            (server_rx, server_tx)
        });
        assert!(connected.is_ok());

        let first = attempts.recv().await.unwrap().unwrap_err();
        assert_eq!(first.to_string(), "bad key");
        assert!(attempts.recv().await.unwrap().is_ok());
        // Returning the live socket is not a new attempt.
        manager.connect().await.unwrap();
        assert!(attempts.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_disconnect_reports_and_resets_state() {
        let (manager, errors, mut servers) =
            manager(Some(json!({"event": "connect", "data": {"sid": "s"}})));
        let seen = record_errors(&errors);
        let socket = manager.connect().await.unwrap();
        let (_server_rx, server_tx) = servers.recv().await.unwrap();

        server_tx
            .send(json!({"event": "disconnect", "data": {"reason": SERVER_DISCONNECT_REASON}}).to_string())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!socket.is_connected());
        assert!(!manager.is_connected());
        assert_eq!(seen.lock().unwrap()[0].code.as_deref(), Some("SERVER_DISCONNECT"));
    }

    #[tokio::test]
    async fn client_disconnect_does_not_report() {
        let (manager, errors, _servers) =
            manager(Some(json!({"event": "connect", "data": {"sid": "s"}})));
        let seen = record_errors(&errors);
        let socket = manager.connect().await.unwrap();

        manager.disconnect();
        manager.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!socket.is_connected());
        assert!(matches!(
            socket.emit(ClientEvent::Message(Message::new(
                crate::protocol::MessageKind::Chat,
                "late",
                None
            ))),
            Err(SparkError::NotConnected)
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ack_is_routed_by_id() {
        let (manager, _errors, mut servers) =
            manager(Some(json!({"event": "connect", "data": {"sid": "s"}})));
        let socket = manager.connect().await.unwrap();
        let (mut server_rx, server_tx) = servers.recv().await.unwrap();
        let _hello = server_rx.recv().await.unwrap();

        let ack_rx = socket
            .request(|ack| ClientEvent::JoinRoom {
                room: "lobby".into(),
                ack,
            })
            .unwrap();
        let frame: ClientEvent = serde_json::from_str(&server_rx.recv().await.unwrap()).unwrap();
        let ClientEvent::JoinRoom { ack, .. } = frame else {
            panic!("expected join-room, got {frame:?}");
        };
        server_tx
            .send(json!({"event": "ack", "data": {"id": ack}}).to_string())
            .unwrap();

        let payload = ack_rx.await.unwrap();
        assert_eq!(payload.id, ack);
        assert_eq!(payload.error, None);
    }

    #[tokio::test]
    async fn inbound_events_buffer_until_attached() {
        struct Collect(Mutex<Vec<InboundEvent>>);
        impl EventListener for Collect {
            fn on_event(&self, event: &InboundEvent) {
                self.0.lock().unwrap().push(event.clone());
            }
        }

        let (manager, _errors, mut servers) =
            manager(Some(json!({"event": "connect", "data": {"sid": "s"}})));
        let socket = manager.connect().await.unwrap();
        let (_server_rx, server_tx) = servers.recv().await.unwrap();
        for content in ["one", "two"] {
            server_tx
                .send(json!({"event": "message", "data": {"type": "chat", "content": content}}).to_string())
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let listener = Arc::new(Collect(Mutex::new(Vec::new())));
        socket.attach(Arc::clone(&listener) as Arc<dyn EventListener>);
        server_tx
            .send(json!({"event": "message", "data": {"type": "chat", "content": "three"}}).to_string())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let contents: Vec<String> = listener
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|event| match event {
                InboundEvent::Message(m) => m.content.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn tracking_a_request_prunes_abandoned_reply_slots() {
        let mut acks = HashMap::new();
        let (abandoned, abandoned_rx) = oneshot::channel();
        let (waiting, _waiting_rx) = oneshot::channel();
        track_request(&mut acks, 1, abandoned);
        track_request(&mut acks, 2, waiting);
        assert_eq!(acks.len(), 2);

        drop(abandoned_rx);
        let (fresh, _fresh_rx) = oneshot::channel();
        track_request(&mut acks, 3, fresh);

        let mut ids: Vec<u64> = acks.keys().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![2, 3]);
    }
}
