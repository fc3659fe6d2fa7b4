//! Sending and receiving messages over a live connection.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::debug;

use crate::connection::{EventListener, InboundEvent, SocketHandle};
use crate::error::{Result, SparkError};
use crate::protocol::{ClientEvent, ConnectedData, Message, MessageKind};
use crate::subscription::{dispatch, lock, Registry, Subscription};

const DEFAULT_CONNECTED_MESSAGE: &str = "Connected to server";

/// Callback registries fed by the socket's inbound events.
pub(crate) struct MessageRegistries {
    socket_id: String,
    bound_at: SystemTime,
    pub(crate) messages: Arc<Mutex<Registry<Message>>>,
    pub(crate) room_messages: Arc<Mutex<Registry<Message>>>,
    pub(crate) connected: Arc<Mutex<Registry<ConnectedData>>>,
}

impl EventListener for MessageRegistries {
    fn on_event(&self, event: &InboundEvent) {
        match event {
            InboundEvent::Connected(payload) => {
                let data = ConnectedData {
                    message: payload
                        .message
                        .clone()
                        .unwrap_or_else(|| DEFAULT_CONNECTED_MESSAGE.to_owned()),
                    socket_id: payload
                        .socket_id
                        .clone()
                        .unwrap_or_else(|| self.socket_id.clone()),
                    connected_at: Some(self.bound_at),
                };
                dispatch("connected", &self.connected, &data);
            }
            InboundEvent::Message(message) => dispatch("message", &self.messages, message),
            InboundEvent::RoomMessage(message) => {
                dispatch("room-message", &self.room_messages, message);
            }
        }
    }
}

/// Point-to-point and room messaging bound to one connection.
///
/// Created unattached: registrations can be made (or adopted from a pending
/// queue) before [`listen`](MessageChannel::listen) starts inbound delivery.
pub struct MessageChannel {
    socket: SocketHandle,
    registries: Arc<MessageRegistries>,
}

impl MessageChannel {
    pub fn new(socket: SocketHandle) -> Self {
        let registries = Arc::new(MessageRegistries {
            socket_id: socket.id().to_owned(),
            bound_at: SystemTime::now(),
            messages: Arc::default(),
            room_messages: Arc::default(),
            connected: Arc::default(),
        });
        Self { socket, registries }
    }

    /// Start inbound delivery. Events received before this call are
    /// delivered first, in order.
    pub fn listen(&self) {
        self.socket
            .attach(Arc::clone(&self.registries) as Arc<dyn EventListener>);
    }

    /// Send a point-to-point message.
    ///
    /// Success only means the frame was handed to the transport; delivery
    /// failures surface later on the error channel.
    ///
    /// # Errors
    ///
    /// - [`SparkError::NotConnected`] if the connection is gone
    /// - [`SparkError::TransportClosed`] if the transport loop has already
    ///   stopped taking frames
    pub fn send(&self, kind: MessageKind, content: &str, sender: Option<&str>) -> Result<()> {
        self.ensure_connected()?;
        let message = Message::new(kind, content, sender.map(str::to_owned));
        debug!(kind = ?message.kind, "sending message");
        self.socket.emit(ClientEvent::Message(message))
    }

    /// Send a message to everyone in `room`.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub fn send_to_room(
        &self,
        room: &str,
        kind: MessageKind,
        content: &str,
        sender: Option<&str>,
    ) -> Result<()> {
        self.ensure_connected()?;
        let message = Message::for_room(room, kind, content, sender.map(str::to_owned));
        debug!(room, kind = ?message.kind, "sending room message");
        self.socket.emit(ClientEvent::RoomMessage(message))
    }

    pub fn on_message(&self, callback: impl Fn(&Message) + Send + Sync + 'static) -> Subscription {
        register(&self.registries.messages, Arc::new(callback))
    }

    pub fn on_room_message(
        &self,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Subscription {
        register(&self.registries.room_messages, Arc::new(callback))
    }

    /// Register for the server's `connected` welcome event.
    pub fn on_connected(
        &self,
        callback: impl Fn(&ConnectedData) + Send + Sync + 'static,
    ) -> Subscription {
        register(&self.registries.connected, Arc::new(callback))
    }

    /// Drop every registration.
    pub fn clear(&self) {
        lock(&self.registries.messages).clear();
        lock(&self.registries.room_messages).clear();
        lock(&self.registries.connected).clear();
    }

    pub fn socket_id(&self) -> &str {
        self.socket.id()
    }

    /// Local time the channel was bound to its connection.
    pub fn bound_at(&self) -> SystemTime {
        self.registries.bound_at
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    pub(crate) fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    pub(crate) fn registries(&self) -> &MessageRegistries {
        &self.registries
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.socket.is_connected() {
            Ok(())
        } else {
            Err(SparkError::NotConnected)
        }
    }
}

fn register<T: 'static>(
    registry: &Arc<Mutex<Registry<T>>>,
    callback: crate::subscription::Callback<T>,
) -> Subscription {
    let id = lock(registry).insert(callback);
    Subscription::for_registry(id, registry)
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("socket", &self.socket)
            .finish()
    }
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
    use crate::connection::Loopback;
    use crate::protocol::ConnectedPayload;

    fn inbound(content: &str) -> InboundEvent {
        InboundEvent::Message(Message {
            kind: MessageKind::Chat,
            content: content.into(),
            sender: None,
            timestamp: None,
            room: None,
        })
    }

    fn listening(socket: SocketHandle) -> MessageChannel {
        let channel = MessageChannel::new(socket);
        channel.listen();
        channel
    }

    fn collect<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value: &T| sink.lock().unwrap().push(value.clone()))
    }

    #[tokio::test]
    async fn send_emits_message_frame() {
        let (socket, mut server) = Loopback::socket("s1");
        let channel = listening(socket);

        channel.send(MessageKind::Chat, "hi", Some("alice")).unwrap();
        channel
            .send_to_room("lobby", MessageKind::Notification, "ping", None)
            .unwrap();

        let Some(ClientEvent::Message(first)) = server.try_next() else {
            panic!("expected a message frame");
        };
        assert_eq!(first.content, "hi");
        assert_eq!(first.sender.as_deref(), Some("alice"));
        assert!(first.timestamp.is_some());

        let Some(ClientEvent::RoomMessage(second)) = server.try_next() else {
            panic!("expected a room-message frame");
        };
        assert_eq!(second.room.as_deref(), Some("lobby"));
        assert_eq!(second.kind, MessageKind::Notification);
    }

    #[tokio::test]
    async fn send_after_connection_loss_fails() {
        let (socket, server) = Loopback::socket("s1");
        let channel = listening(socket);
        server.drop_connection();

        let err = channel.send(MessageKind::Chat, "late", None).unwrap_err();
        assert!(matches!(err, SparkError::NotConnected));
        let err = channel
            .send_to_room("lobby", MessageKind::Chat, "late", None)
            .unwrap_err();
        assert!(matches!(err, SparkError::NotConnected));
    }

    #[tokio::test]
    async fn send_after_loop_stopped_reports_closed_transport() {
        let (socket, server) = Loopback::socket("s1");
        let channel = listening(socket);
        // The loop is gone but has not yet flagged the socket as closed.
        drop(server);

        let err = channel.send(MessageKind::Chat, "late", None).unwrap_err();
        assert!(matches!(err, SparkError::TransportClosed));
    }

    #[tokio::test]
    async fn events_before_listen_are_delivered_in_order() {
        let (socket, server) = Loopback::socket("s1");
        let channel = MessageChannel::new(socket);
        server.deliver(inbound("early"));

        let (seen, callback) = collect::<Message>();
        let _sub = channel.on_message(callback);
        channel.listen();
        server.deliver(inbound("late"));

        let contents: Vec<_> = seen.lock().unwrap().iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn room_messages_only_reach_room_callbacks() {
        let (socket, server) = Loopback::socket("s1");
        let channel = listening(socket);
        let (direct, direct_cb) = collect::<Message>();
        let (room, room_cb) = collect::<Message>();
        let _a = channel.on_message(direct_cb);
        let _b = channel.on_room_message(room_cb);

        server.deliver(InboundEvent::RoomMessage(Message::for_room(
            "lobby",
            MessageKind::Chat,
            "hello room",
            None,
        )));

        assert!(direct.lock().unwrap().is_empty());
        assert_eq!(room.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connected_event_fills_defaults() {
        let (socket, server) = Loopback::socket("s1");
        let channel = listening(socket);
        let (seen, callback) = collect::<ConnectedData>();
        let _sub = channel.on_connected(callback);

        server.deliver(InboundEvent::Connected(ConnectedPayload::default()));
        server.deliver(InboundEvent::Connected(ConnectedPayload {
            message: Some("welcome".into()),
            socket_id: Some("server-side".into()),
        }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].message, "Connected to server");
        assert_eq!(seen[0].socket_id, "s1");
        assert_eq!(seen[0].connected_at, Some(channel.bound_at()));
        assert_eq!(seen[1].message, "welcome");
        assert_eq!(seen[1].socket_id, "server-side");
    }

    #[tokio::test]
    async fn unsubscribe_and_clear_stop_delivery() {
        let (socket, server) = Loopback::socket("s1");
        let channel = listening(socket);
        let (first, first_cb) = collect::<Message>();
        let (second, second_cb) = collect::<Message>();
        let sub = channel.on_message(first_cb);
        let _keep = channel.on_message(second_cb);

        sub.unsubscribe();
        server.deliver(inbound("one"));
        channel.clear();
        server.deliver(inbound("two"));

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }
}
