use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, ConnectionId};

#[derive(Debug, Default)]
struct UserEntry {
    /// Rooms whose durable participant add has been confirmed.
    rooms: HashSet<Uuid>,
    /// Joins reserved locally while their durable commit is pending.
    pending: HashSet<Uuid>,
    connections: HashSet<ConnectionId>,
}

/// Process-local, advisory index of which rooms each connected user has joined.
///
/// One entry per user, shared by all of that user's connections, and dropped
/// when the last of them disconnects. Only a committed [`JoinGuard`] marks a
/// room joined. Authorization always has a durable fallback; a miss here
/// never denies on its own.
#[derive(Debug, Default)]
pub struct MembershipCache {
    users: RwLock<HashMap<Uuid, UserEntry>>,
}

pub enum JoinStart {
    Reserved(JoinGuard),
    AlreadyJoined,
    InProgress,
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, UserEntry>> {
        self.users.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, UserEntry>> {
        self.users.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attach(&self, user_id: Uuid, connection_id: ConnectionId) {
        self.write().entry(user_id).or_default().connections.insert(connection_id);
    }

    /// Returns `true` when this was the user's last connection and the entry was dropped.
    pub fn detach(&self, user_id: Uuid, connection_id: ConnectionId) -> bool {
        let mut users = self.write();
        let Some(entry) = users.get_mut(&user_id) else {
            return false;
        };
        entry.connections.remove(&connection_id);
        if entry.connections.is_empty() {
            users.remove(&user_id);
            true
        } else {
            false
        }
    }

    pub fn is_member(&self, user_id: Uuid, room_id: Uuid) -> bool {
        self.read().get(&user_id).is_some_and(|entry| entry.rooms.contains(&room_id))
    }

    pub fn connections_of(&self, user_id: Uuid) -> Vec<ConnectionId> {
        self.read()
            .get(&user_id)
            .map(|entry| entry.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, user_id: Uuid, room_id: Uuid) -> bool {
        self.write().get_mut(&user_id).is_some_and(|entry| entry.rooms.remove(&room_id))
    }

    /// Reserve `(user, room)` for a join driven by `connection_id`.
    pub fn begin_join(
        self: &Arc<Self>,
        user_id: Uuid,
        room_id: Uuid,
        connection_id: ConnectionId,
        broadcast: Arc<dyn BroadcastGroup>,
    ) -> JoinStart {
        let mut users = self.write();
        let entry = users.entry(user_id).or_default();
        entry.connections.insert(connection_id);

        if entry.rooms.contains(&room_id) {
            return JoinStart::AlreadyJoined;
        }
        if !entry.pending.insert(room_id) {
            return JoinStart::InProgress;
        }

        JoinStart::Reserved(JoinGuard {
            cache: Arc::clone(self),
            broadcast,
            user_id,
            room_id,
            connection_id,
            subscribed: false,
            committed: false,
        })
    }
}

/// A pending local join. Dropping it without [`JoinGuard::commit`] undoes the
/// reservation and the broadcast subscription, including when the owning
/// future is cancelled by a disconnect.
pub struct JoinGuard {
    cache: Arc<MembershipCache>,
    broadcast: Arc<dyn BroadcastGroup>,
    user_id: Uuid,
    room_id: Uuid,
    connection_id: ConnectionId,
    subscribed: bool,
    committed: bool,
}

impl JoinGuard {
    pub fn subscribe(&mut self) {
        self.broadcast.subscribe(self.room_id, self.connection_id);
        self.subscribed = true;
    }

    pub fn commit(mut self) {
        if let Some(entry) = self.cache.write().get_mut(&self.user_id) {
            entry.pending.remove(&self.room_id);
            entry.rooms.insert(self.room_id);
        }
        self.committed = true;
    }
}

impl Drop for JoinGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(entry) = self.cache.write().get_mut(&self.user_id) {
            entry.pending.remove(&self.room_id);
        }
        if self.subscribed {
            self.broadcast.unsubscribe(self.room_id, self.connection_id);
        }
        tracing::debug!(user_id = %self.user_id, room_id = %self.room_id, "rolled back local join");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalBroadcast;

    fn reserve(cache: &Arc<MembershipCache>, hub: &Arc<LocalBroadcast>, user: Uuid, room: Uuid, conn: Uuid) -> JoinStart {
        cache.begin_join(user, room, conn, hub.clone())
    }

    #[test]
    fn committed_join_is_visible_to_all_user_connections() {
        let cache = Arc::new(MembershipCache::new());
        let hub = Arc::new(LocalBroadcast::new());
        let (user, room) = (Uuid::new_v4(), Uuid::new_v4());
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        cache.attach(user, second);

        let JoinStart::Reserved(mut guard) = reserve(&cache, &hub, user, room, first) else {
            panic!("first join should reserve");
        };
        assert!(!cache.is_member(user, room));
        guard.subscribe();
        guard.commit();

        assert!(cache.is_member(user, room));
        assert!(matches!(reserve(&cache, &hub, user, room, second), JoinStart::AlreadyJoined));
    }

    #[test]
    fn dropped_guard_rolls_back_reservation_and_subscription() {
        let cache = Arc::new(MembershipCache::new());
        let hub = Arc::new(LocalBroadcast::new());
        let (user, room, conn) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        {
            let JoinStart::Reserved(mut guard) = reserve(&cache, &hub, user, room, conn) else {
                panic!("join should reserve");
            };
            guard.subscribe();
            assert!(hub.is_subscribed(room, conn));
            assert!(matches!(reserve(&cache, &hub, user, room, conn), JoinStart::InProgress));
        }

        assert!(!cache.is_member(user, room));
        assert!(!hub.is_subscribed(room, conn));
        assert!(matches!(reserve(&cache, &hub, user, room, conn), JoinStart::Reserved(_)));
    }

    #[test]
    fn entry_lives_until_last_connection_detaches() {
        let cache = Arc::new(MembershipCache::new());
        let hub = Arc::new(LocalBroadcast::new());
        let (user, room) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        cache.attach(user, b);
        let JoinStart::Reserved(guard) = reserve(&cache, &hub, user, room, a) else {
            panic!("join should reserve");
        };
        guard.commit();

        assert!(!cache.detach(user, a));
        assert!(cache.is_member(user, room));
        assert!(cache.detach(user, b));
        assert!(!cache.is_member(user, room));
    }

    #[test]
    fn commit_after_last_disconnect_leaves_no_entry() {
        let cache = Arc::new(MembershipCache::new());
        let hub = Arc::new(LocalBroadcast::new());
        let (user, room, conn) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let JoinStart::Reserved(guard) = reserve(&cache, &hub, user, room, conn) else {
            panic!("join should reserve");
        };

        assert!(cache.detach(user, conn));
        guard.commit();
        assert!(!cache.is_member(user, room));
        assert!(cache.connections_of(user).is_empty());
    }
}
