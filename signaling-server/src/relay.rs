/*!
In-memory room registry and message routing.

Each room is guarded by its own lock, so traffic in one room never waits on another.
The registry lock is only held to find, create or discard a room, never while waiting
on a room lock. A room is marked discarded under its own lock before it leaves the
registry, and a join that ends up holding a discarded room starts over.
*/

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use peercall_protocol::{ProtocolViolation, RoomId, SignalKind, SignalMessage, UserId};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};

/// Process unique identifier of one accepted connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a freshly registered connection needs to serve its peer.
#[derive(Debug)]
pub struct Registration {
    pub connection_id: ConnectionId,
    /// Frames the relay wants written to this connection, in order.
    pub receiver: mpsc::UnboundedReceiver<SignalMessage>,
}

/// Outcome of [`RelayServer::relay`]. Everything but `Delivered` means the frame was dropped.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Delivery {
    Delivered,
    Rejected(ProtocolViolation),
    NotRelayable(SignalKind),
    UnknownRoom,
    StaleConnection,
    UnknownPeer(UserId),
    PeerGone(UserId),
}

impl Delivery {
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

#[derive(Debug)]
struct Member {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

impl Member {
    fn send(&self, user_id: &UserId, message: SignalMessage) -> bool {
        if self.tx.send(message).is_err() {
            debug!(
                "connection {} of {} is already closed",
                self.connection_id, user_id
            );
            return false;
        }
        true
    }
}

#[derive(Debug, Default)]
struct Room {
    members: BTreeMap<UserId, Member>,
    discarded: bool,
}

type Rooms = Arc<RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>>;

/// Routes signaling frames between the members of each room.
///
/// Cheap to clone, all clones share the same rooms.
#[derive(Debug, Clone, Default)]
pub struct RelayServer {
    rooms: Rooms,
    next_connection_id: Arc<AtomicU64>,
}

impl RelayServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `user_id` in `room_id`.
    ///
    /// A previous connection of the same user in the same room is replaced and simply
    /// stops receiving frames. Every other member is told about the joiner before the
    /// joiner receives the list of members already present.
    pub async fn connect(&self, room_id: &RoomId, user_id: &UserId) -> Registration {
        let connection_id =
            ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut room = self.lock_or_create(room_id).await;
        let member = Member { connection_id, tx };
        if let Some(previous) = room.members.insert(user_id.clone(), member) {
            info!(
                "connection {} of {} in room {} replaced by {}",
                previous.connection_id, user_id, room_id, connection_id
            );
        } else {
            info!(
                "user {} joined room {} with connection {}",
                user_id, room_id, connection_id
            );
        }

        let mut existing = Vec::with_capacity(room.members.len());
        for (peer_id, peer) in &room.members {
            if peer_id == user_id {
                continue;
            }
            peer.send(
                peer_id,
                SignalMessage::peer_joined(room_id.clone(), user_id.clone()),
            );
            existing.push(peer_id.clone());
        }
        if let Some(joiner) = room.members.get(user_id) {
            joiner.send(
                user_id,
                SignalMessage::existing_peers(room_id.clone(), user_id.clone(), existing),
            );
        }

        Registration {
            connection_id,
            receiver: rx,
        }
    }

    /// Forwards a directed frame sent by `sender` over `connection_id`.
    ///
    /// The sender and room fields of the frame are overwritten with the values the
    /// connection was registered with. The target is looked up in the same room only.
    pub async fn relay(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        connection_id: ConnectionId,
        mut message: SignalMessage,
    ) -> Delivery {
        if let Err(violation) = message.validate() {
            return Delivery::Rejected(violation);
        }
        if !message.kind.is_directed() {
            return Delivery::NotRelayable(message.kind);
        }
        let Some(target) = message.to_peer_id.clone() else {
            return Delivery::Rejected(ProtocolViolation::MissingTarget(message.kind));
        };
        let Some(room) = self.room(room_id).await else {
            return Delivery::UnknownRoom;
        };

        let room = room.lock().await;
        match room.members.get(sender) {
            Some(member) if member.connection_id == connection_id => {}
            _ => return Delivery::StaleConnection,
        }

        message.from_user_id = sender.clone();
        message.room_id = room_id.clone();
        match room.members.get(&target) {
            None => Delivery::UnknownPeer(target),
            Some(member) => {
                debug!(
                    "relaying {} from {} to {} in room {}",
                    message.kind, sender, target, room_id
                );
                if member.send(&target, message) {
                    Delivery::Delivered
                } else {
                    Delivery::PeerGone(target)
                }
            }
        }
    }

    /// Removes `user_id` from `room_id` if `connection_id` is still its current connection.
    ///
    /// Returns whether a member was removed. Remaining members receive `peer-left`,
    /// an emptied room is discarded.
    pub async fn disconnect(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        connection_id: ConnectionId,
    ) -> bool {
        let Some(room) = self.room(room_id).await else {
            return false;
        };

        let emptied = {
            let mut room = room.lock().await;
            match room.members.get(user_id) {
                Some(member) if member.connection_id == connection_id => {}
                Some(_) => {
                    debug!(
                        "ignoring disconnect of stale connection {} of {} in room {}",
                        connection_id, user_id, room_id
                    );
                    return false;
                }
                None => return false,
            }
            room.members.remove(user_id);
            info!("user {} left room {}", user_id, room_id);

            for (peer_id, peer) in &room.members {
                peer.send(
                    peer_id,
                    SignalMessage::peer_left(room_id.clone(), user_id.clone()),
                );
            }
            room.discarded = room.members.is_empty();
            room.discarded
        };

        if emptied {
            self.discard(room_id, &room).await;
        }
        true
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Current members of `room_id`, sorted.
    pub async fn members(&self, room_id: &RoomId) -> Vec<UserId> {
        match self.room(room_id).await {
            Some(room) => room.lock().await.members.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    async fn room(&self, room_id: &RoomId) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).map(Arc::clone)
    }

    async fn lock_or_create(&self, room_id: &RoomId) -> OwnedMutexGuard<Room> {
        loop {
            let room = {
                let mut rooms = self.rooms.write().await;
                Arc::clone(rooms.entry(room_id.clone()).or_insert_with(|| {
                    debug!("creating room {}", room_id);
                    Arc::default()
                }))
            };
            let guard = Arc::clone(&room).lock_owned().await;
            if !guard.discarded {
                return guard;
            }
            drop(guard);
            debug!("room {} was discarded while joining, retrying", room_id);
            // the emptied room may still be registered until its last member finishes leaving
            self.discard(room_id, &room).await;
        }
    }

    /// Unregisters `room` if it is still the room registered under `room_id`.
    async fn discard(&self, room_id: &RoomId, room: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(room_id)
            .is_some_and(|registered| Arc::ptr_eq(registered, room))
        {
            rooms.remove(room_id);
            info!("room {} is empty, discarding it", room_id);
        }
    }
}
