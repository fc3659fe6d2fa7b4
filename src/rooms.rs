//! Room membership over a live connection.
//!
//! Each room moves through `NotJoined → Joining → Joined → Leaving →
//! NotJoined`. Only one `join-room` or `leave-room` request per room is ever
//! in flight: callers arriving while a request for the same transition is
//! pending share its outcome, and callers wanting the opposite transition
//! wait for it to settle and then re-evaluate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::SocketHandle;
use crate::error::{Result, SparkError};
use crate::protocol::{AckPayload, ClientEvent};
use crate::subscription::lock;

type Waiters = Vec<oneshot::Sender<Result<()>>>;

enum Membership {
    Joining(Waiters),
    Joined,
    Leaving(Waiters),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Join,
    Leave,
}

impl Op {
    fn event(self, room: &str, ack: u64) -> ClientEvent {
        let room = room.to_owned();
        match self {
            Self::Join => ClientEvent::JoinRoom { room, ack },
            Self::Leave => ClientEvent::LeaveRoom { room, ack },
        }
    }

    fn failure(self, room: &str, message: impl Into<String>) -> SparkError {
        let room = room.to_owned();
        let message = message.into();
        match self {
            Self::Join => SparkError::JoinRoomFailed { room, message },
            Self::Leave => SparkError::LeaveRoomFailed { room, message },
        }
    }
}

enum Step {
    Settled,
    Share(oneshot::Receiver<Result<()>>),
    AwaitOpposite(oneshot::Receiver<Result<()>>),
    Request,
}

type Rooms = Arc<Mutex<BTreeMap<String, Membership>>>;

/// Tracks which rooms this connection has joined.
pub struct RoomManager {
    socket: SocketHandle,
    ack_timeout: Duration,
    rooms: Rooms,
}

impl RoomManager {
    pub fn new(socket: SocketHandle, ack_timeout: Duration) -> Self {
        Self {
            socket,
            ack_timeout,
            rooms: Arc::default(),
        }
    }

    /// Join `room`.
    ///
    /// Returns `Ok(true)` if this call changed membership and `Ok(false)` if
    /// the room was already joined (or another caller's join succeeded).
    ///
    /// # Errors
    ///
    /// - [`SparkError::NotConnected`] if the connection is gone
    /// - [`SparkError::JoinRoomFailed`] if the server rejects the join
    /// - [`SparkError::AckTimeout`] if the server does not answer in time
    pub async fn join_room(&self, room: &str) -> Result<bool> {
        self.transition(room, Op::Join).await
    }

    /// Leave `room`. Leaving a room that was never joined is a no-op.
    ///
    /// # Errors
    ///
    /// - [`SparkError::NotConnected`] if the connection is gone
    /// - [`SparkError::LeaveRoomFailed`] if the server rejects the leave
    /// - [`SparkError::AckTimeout`] if the server does not answer in time
    pub async fn leave_room(&self, room: &str) -> Result<bool> {
        self.transition(room, Op::Leave).await
    }

    /// Leave every joined room concurrently. Every leave is attempted even
    /// when some fail; `on_left` is called, in room order, for each room this
    /// call actually left.
    ///
    /// # Errors
    ///
    /// Returns the first failure in room order.
    pub async fn leave_all_rooms(&self, on_left: impl Fn(&str)) -> Result<()> {
        let rooms = self.joined_rooms();
        let outcomes = join_all(rooms.iter().map(|room| self.leave_room(room))).await;

        let mut first_error = None;
        for (room, outcome) in rooms.iter().zip(outcomes) {
            match outcome {
                Ok(true) => on_left(room),
                Ok(false) => {}
                Err(err) => {
                    warn!(%room, "leave failed: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Rooms currently joined, sorted.
    pub fn joined_rooms(&self) -> Vec<String> {
        lock(&self.rooms)
            .iter()
            .filter(|(_, membership)| matches!(membership, Membership::Joined))
            .map(|(room, _)| room.clone())
            .collect()
    }

    pub fn is_in_room(&self, room: &str) -> bool {
        matches!(lock(&self.rooms).get(room), Some(Membership::Joined))
    }

    /// Forget all membership. Pending callers re-evaluate against the
    /// emptied state.
    pub fn clear(&self) {
        lock(&self.rooms).clear();
    }

    async fn transition(&self, room: &str, op: Op) -> Result<bool> {
        loop {
            if !self.socket.is_connected() {
                return Err(SparkError::NotConnected);
            }

            let step = {
                let mut rooms = lock(&self.rooms);
                match (op, rooms.get_mut(room)) {
                    (Op::Join, Some(Membership::Joined)) | (Op::Leave, None) => Step::Settled,
                    (Op::Join, Some(Membership::Joining(waiters)))
                    | (Op::Leave, Some(Membership::Leaving(waiters))) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Step::Share(rx)
                    }
                    (Op::Join, Some(Membership::Leaving(waiters)))
                    | (Op::Leave, Some(Membership::Joining(waiters))) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Step::AwaitOpposite(rx)
                    }
                    (Op::Join, None) => {
                        rooms.insert(room.to_owned(), Membership::Joining(Vec::new()));
                        Step::Request
                    }
                    (Op::Leave, Some(entry @ Membership::Joined)) => {
                        *entry = Membership::Leaving(Vec::new());
                        Step::Request
                    }
                }
            };

            match step {
                Step::Settled => {
                    debug!(room, ?op, "room already settled, skipping round-trip");
                    return Ok(false);
                }
                Step::Share(rx) => match rx.await {
                    Ok(outcome) => return outcome.map(|()| false),
                    // The owning request was dropped or membership was cleared.
                    Err(_) => continue,
                },
                Step::AwaitOpposite(rx) => {
                    let _ = rx.await;
                    continue;
                }
                Step::Request => {
                    let mut pending = PendingRequest {
                        rooms: &self.rooms,
                        room,
                        op,
                        done: false,
                    };
                    let outcome = self.round_trip(room, op).await;
                    pending.settle(&outcome);
                    return outcome.map(|()| true);
                }
            }
        }
    }

    async fn round_trip(&self, room: &str, op: Op) -> Result<()> {
        debug!(room, ?op, "sending room request");
        let ack = self.socket.request(|id| op.event(room, id))?;
        match tokio::time::timeout(self.ack_timeout, ack).await {
            Err(_) => {
                warn!(room, ?op, "room request timed out");
                Err(SparkError::AckTimeout(room.to_owned()))
            }
            Ok(Err(_)) => Err(op.failure(room, "connection closed before acknowledgement")),
            Ok(Ok(AckPayload {
                error: Some(message),
                ..
            })) => Err(op.failure(room, message)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// Settles the in-flight state of one room request.
///
/// If the request future is dropped before an outcome arrives, the room
/// reverts to its previous state and waiters re-evaluate.
struct PendingRequest<'a> {
    rooms: &'a Rooms,
    room: &'a str,
    op: Op,
    done: bool,
}

impl PendingRequest<'_> {
    fn settle(&mut self, outcome: &Result<()>) {
        self.done = true;
        let succeeded = outcome.is_ok();
        let settled = match (self.op, succeeded) {
            (Op::Join, true) | (Op::Leave, false) => Some(Membership::Joined),
            (Op::Join, false) | (Op::Leave, true) => None,
        };
        if let Some(waiters) = self.resolve(settled) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Replaces this request's in-flight entry with `settled` and returns its
    /// waiters. Leaves the map untouched if the entry was cleared meanwhile.
    fn resolve(&self, settled: Option<Membership>) -> Option<Waiters> {
        let mut rooms = lock(self.rooms);
        let waiters = match (self.op, rooms.remove(self.room)?) {
            (Op::Join, Membership::Joining(waiters)) | (Op::Leave, Membership::Leaving(waiters)) => {
                waiters
            }
            (_, other) => {
                rooms.insert(self.room.to_owned(), other);
                return None;
            }
        };
        if let Some(membership) = settled {
            rooms.insert(self.room.to_owned(), membership);
        }
        Some(waiters)
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if !self.done {
            let previous = match self.op {
                Op::Join => None,
                Op::Leave => Some(Membership::Joined),
            };
            // Dropping the waiters makes them re-evaluate.
            drop(self.resolve(previous));
        }
    }
}

impl std::fmt::Debug for RoomManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomManager")
            .field("joined", &self.joined_rooms())
            .field("ack_timeout", &self.ack_timeout)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::connection::Loopback;

    fn manager() -> (RoomManager, Loopback) {
        let (socket, server) = Loopback::socket("s1");
        (RoomManager::new(socket, Duration::from_secs(5)), server)
    }

    /// Answers the next room request with `error`.
    async fn answer(server: &mut Loopback, error: Option<&str>) -> ClientEvent {
        let (event, reply) = server.next().await.unwrap();
        let id = match &event {
            ClientEvent::JoinRoom { ack, .. } | ClientEvent::LeaveRoom { ack, .. } => *ack,
            other => panic!("expected a room request, got {other:?}"),
        };
        reply
            .unwrap()
            .send(AckPayload {
                id,
                error: error.map(str::to_owned),
            })
            .unwrap();
        event
    }

    #[tokio::test]
    async fn join_then_leave() {
        let (rooms, mut server) = manager();

        let (joined, event) = tokio::join!(rooms.join_room("lobby"), answer(&mut server, None));
        assert!(joined.unwrap());
        assert!(matches!(event, ClientEvent::JoinRoom { ref room, .. } if room == "lobby"));
        assert!(rooms.is_in_room("lobby"));

        let (left, event) = tokio::join!(rooms.leave_room("lobby"), answer(&mut server, None));
        assert!(left.unwrap());
        assert!(matches!(event, ClientEvent::LeaveRoom { .. }));
        assert!(!rooms.is_in_room("lobby"));
    }

    #[tokio::test]
    async fn repeated_join_skips_round_trip() {
        let (rooms, mut server) = manager();
        let (first, _) = tokio::join!(rooms.join_room("lobby"), answer(&mut server, None));
        assert!(first.unwrap());

        assert!(!rooms.join_room("lobby").await.unwrap());
        assert!(server.try_next().is_none());
    }

    #[tokio::test]
    async fn concurrent_joins_share_one_request() {
        let (rooms, mut server) = manager();

        let (a, b, _) = tokio::join!(
            rooms.join_room("lobby"),
            rooms.join_room("lobby"),
            answer(&mut server, None)
        );
        assert!(a.unwrap() ^ b.unwrap());
        assert!(server.try_next().is_none());
        assert_eq!(rooms.joined_rooms(), vec!["lobby"]);
    }

    #[tokio::test]
    async fn leave_unjoined_room_is_immediate() {
        let (rooms, mut server) = manager();
        assert!(!rooms.leave_room("nowhere").await.unwrap());
        assert!(server.try_next().is_none());
    }

    #[tokio::test]
    async fn rejected_join_keeps_room_unjoined() {
        let (rooms, mut server) = manager();

        let (result, _) =
            tokio::join!(rooms.join_room("lobby"), answer(&mut server, Some("room full")));
        let err = result.unwrap_err();
        assert!(matches!(err, SparkError::JoinRoomFailed { .. }));
        assert_eq!(err.to_string(), "room full");
        assert!(!rooms.is_in_room("lobby"));
    }

    #[tokio::test]
    async fn rejected_leave_keeps_room_joined() {
        let (rooms, mut server) = manager();
        let (joined, _) = tokio::join!(rooms.join_room("lobby"), answer(&mut server, None));
        joined.unwrap();

        let (result, _) =
            tokio::join!(rooms.leave_room("lobby"), answer(&mut server, Some("nope")));
        assert!(matches!(result, Err(SparkError::LeaveRoomFailed { .. })));
        assert!(rooms.is_in_room("lobby"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out() {
        let (socket, mut server) = Loopback::socket("s1");
        let rooms = RoomManager::new(socket, Duration::from_millis(100));

        let (result, held) = tokio::join!(rooms.join_room("lobby"), server.next());
        assert!(matches!(result, Err(SparkError::AckTimeout(ref room)) if room == "lobby"));
        assert!(!rooms.is_in_room("lobby"));
        drop(held);
    }

    #[tokio::test]
    async fn disconnected_socket_rejects_requests() {
        let (rooms, server) = manager();
        server.drop_connection();

        assert!(matches!(
            rooms.join_room("lobby").await,
            Err(SparkError::NotConnected)
        ));
        assert!(matches!(
            rooms.leave_room("lobby").await,
            Err(SparkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn leave_all_attempts_every_room() {
        let (rooms, mut server) = manager();
        for room in ["a", "b", "c"] {
            let (joined, _) = tokio::join!(rooms.join_room(room), answer(&mut server, None));
            joined.unwrap();
        }

        let left = Mutex::new(Vec::new());
        let on_left = |room: &str| left.lock().unwrap().push(room.to_owned());
        let (result, ()) = tokio::join!(rooms.leave_all_rooms(on_left), async {
            let mut answered = Vec::new();
            for _ in 0..3 {
                let (event, reply) = server.next().await.unwrap();
                let ClientEvent::LeaveRoom { room, ack } = event else {
                    panic!("expected leave-room");
                };
                let error = (room == "b").then(|| "locked".to_owned());
                reply.unwrap().send(AckPayload { id: ack, error }).unwrap();
                answered.push(room);
            }
            answered.sort();
            assert_eq!(answered, vec!["a", "b", "c"]);
        });

        let err = result.unwrap_err();
        assert!(matches!(err, SparkError::LeaveRoomFailed { ref room, .. } if room == "b"));
        assert_eq!(rooms.joined_rooms(), vec!["b"]);
        assert_eq!(*left.lock().unwrap(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn leave_all_with_no_rooms_sends_nothing() {
        let (rooms, mut server) = manager();
        rooms.leave_all_rooms(|room| panic!("unexpected leave of {room}")).await.unwrap();
        assert!(server.try_next().is_none());
    }

    #[tokio::test]
    async fn clear_forgets_membership() {
        let (rooms, mut server) = manager();
        let (joined, _) = tokio::join!(rooms.join_room("r"), answer(&mut server, None));
        joined.unwrap();

        rooms.clear();
        assert!(!rooms.is_in_room("r"));
        assert!(rooms.joined_rooms().is_empty());
    }
}
