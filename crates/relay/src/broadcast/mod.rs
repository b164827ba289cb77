// Per-room fan-out of server events to live connections.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use parley_common::protocol::ws::ServerEvent;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics;

pub type ConnectionId = Uuid;
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

/// Publish capability the room and message services depend on.
///
/// Implementations must never block on a slow subscriber. Methods are
/// synchronous so they can run from `Drop` during join rollback.
pub trait BroadcastGroup: Send + Sync {
    fn subscribe(&self, room_id: Uuid, connection_id: ConnectionId);

    fn unsubscribe(&self, room_id: Uuid, connection_id: ConnectionId);

    /// Deliver `event` to every current subscriber of `room_id`. Returns the delivery count.
    fn publish(&self, room_id: Uuid, event: &ServerEvent) -> usize;
}

#[derive(Default)]
struct Registry {
    outbound: HashMap<ConnectionId, Outbound>,
    rooms: HashMap<Uuid, HashSet<ConnectionId>>,
}

/// In-process broadcast hub backed by one unbounded channel per connection.
#[derive(Default)]
pub struct LocalBroadcast {
    registry: RwLock<Registry>,
}

impl LocalBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, connection_id: ConnectionId, outbound: Outbound) {
        self.write().outbound.insert(connection_id, outbound);
    }

    /// Forget a connection and drop it from every room group.
    pub fn deregister(&self, connection_id: ConnectionId) {
        let mut registry = self.write();
        registry.outbound.remove(&connection_id);
        registry.rooms.retain(|_, members| {
            members.remove(&connection_id);
            !members.is_empty()
        });
    }

    pub fn subscribers(&self, room_id: Uuid) -> usize {
        self.read().rooms.get(&room_id).map_or(0, HashSet::len)
    }

    pub fn is_subscribed(&self, room_id: Uuid, connection_id: ConnectionId) -> bool {
        self.read().rooms.get(&room_id).is_some_and(|members| members.contains(&connection_id))
    }
}

impl BroadcastGroup for LocalBroadcast {
    fn subscribe(&self, room_id: Uuid, connection_id: ConnectionId) {
        self.write().rooms.entry(room_id).or_default().insert(connection_id);
    }

    fn unsubscribe(&self, room_id: Uuid, connection_id: ConnectionId) {
        let mut registry = self.write();
        if let Some(members) = registry.rooms.get_mut(&room_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                registry.rooms.remove(&room_id);
            }
        }
    }

    fn publish(&self, room_id: Uuid, event: &ServerEvent) -> usize {
        let recipients: Vec<Outbound> = {
            let registry = self.read();
            registry
                .rooms
                .get(&room_id)
                .into_iter()
                .flatten()
                .filter_map(|connection_id| registry.outbound.get(connection_id).cloned())
                .collect()
        };

        let total = recipients.len();
        let delivered = recipients.into_iter().filter(|sender| sender.send(event.clone()).is_ok()).count();
        metrics::record_broadcast(delivered as u64, (total - delivered) as u64);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(room_id: Uuid) -> ServerEvent {
        ServerEvent::LeaveRoomSuccess { room_id }
    }

    #[tokio::test]
    async fn publish_reaches_only_room_subscribers() {
        let hub = LocalBroadcast::new();
        let room_id = Uuid::new_v4();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        hub.register(a, a_tx);
        hub.register(b, b_tx);
        hub.subscribe(room_id, a);

        assert_eq!(hub.publish(room_id, &event(room_id)), 1);
        assert_eq!(a_rx.recv().await, Some(event(room_id)));
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscriber_does_not_block_others() {
        let hub = LocalBroadcast::new();
        let room_id = Uuid::new_v4();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        let (dead, live) = (Uuid::new_v4(), Uuid::new_v4());
        hub.register(dead, dead_tx);
        hub.register(live, live_tx);
        hub.subscribe(room_id, dead);
        hub.subscribe(room_id, live);
        drop(dead_rx);

        assert_eq!(hub.publish(room_id, &event(room_id)), 1);
        assert_eq!(live_rx.recv().await, Some(event(room_id)));
    }

    #[test]
    fn deregister_clears_every_subscription() {
        let hub = LocalBroadcast::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = Uuid::new_v4();
        let rooms = [Uuid::new_v4(), Uuid::new_v4()];
        hub.register(connection, tx);
        for room in rooms {
            hub.subscribe(room, connection);
        }

        hub.deregister(connection);
        assert!(rooms.iter().all(|room| hub.subscribers(*room) == 0));
        assert_eq!(hub.publish(rooms[0], &event(rooms[0])), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let hub = LocalBroadcast::new();
        let room_id = Uuid::new_v4();
        let connection = Uuid::new_v4();
        hub.subscribe(room_id, connection);
        hub.unsubscribe(room_id, connection);
        hub.unsubscribe(room_id, connection);
        assert!(!hub.is_subscribed(room_id, connection));
    }
}
