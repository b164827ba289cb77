use std::sync::Arc;
use std::time::Duration;

use parley_common::protocol::error::ErrorKind;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{get_json, room_key, set_json, FastCache};
use crate::error::ChatError;
use crate::metrics;
use crate::store::{DurableStore, NewRoom, Room, StoreError};

use super::membership::MembershipCache;

const ROOM_CACHE_TTL: Duration = Duration::from_secs(300);
const MAX_ROOM_NAME_CHARS: usize = 100;

/// Cache-aside access to rooms. Every participant mutation goes to the
/// durable store first and then evicts `room:{id}`.
pub struct RoomDirectory {
    durable: Arc<dyn DurableStore>,
    cache: Arc<dyn FastCache>,
}

impl RoomDirectory {
    pub fn new(durable: Arc<dyn DurableStore>, cache: Arc<dyn FastCache>) -> Self {
        Self { durable, cache }
    }

    pub async fn find_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        let key = room_key(room_id);
        match get_json::<Room>(self.cache.as_ref(), &key).await {
            Ok(Some(room)) => return Ok(Some(room)),
            Ok(None) => {}
            Err(error) => {
                metrics::record_cache_fallback("room_read");
                warn!(room_id = %room_id, error = %error, "room cache read failed, using durable store");
            }
        }

        let room = self.durable.find_room(room_id).await?;
        if let Some(room) = &room {
            if let Err(error) = set_json(self.cache.as_ref(), &key, room, ROOM_CACHE_TTL).await {
                metrics::record_cache_fallback("room_write");
                debug!(room_id = %room_id, error = %error, "room cache write failed");
            }
        }
        Ok(room)
    }

    /// Creates a room with the creator as its only participant. The creator
    /// still has to join to be subscribed.
    pub async fn create_room(
        &self,
        creator_id: Uuid,
        name: &str,
        password_hash: Option<String>,
    ) -> Result<Room, ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::new(ErrorKind::ValidationFailed, "room name is required"));
        }
        if name.chars().count() > MAX_ROOM_NAME_CHARS {
            return Err(ChatError::new(
                ErrorKind::ValidationFailed,
                format!("room name exceeds {MAX_ROOM_NAME_CHARS} characters"),
            ));
        }

        let room = self
            .durable
            .create_room(NewRoom { name: name.to_owned(), creator_id, password_hash })
            .await?;
        debug!(room_id = %room.id, creator_id = %creator_id, "room created");
        Ok(room)
    }

    /// Returns `true` when the user was not a participant before.
    pub async fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let inserted = self.durable.add_participant(room_id, user_id).await?;
        self.evict(room_id).await;
        Ok(inserted)
    }

    /// Returns `true` when the user was a participant before.
    pub async fn remove_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let removed = self.durable.remove_participant(room_id, user_id).await?;
        self.evict(room_id).await;
        Ok(removed)
    }

    pub async fn evict(&self, room_id: Uuid) {
        if let Err(error) = self.cache.delete(&room_key(room_id)).await {
            metrics::record_cache_fallback("room_evict");
            warn!(room_id = %room_id, error = %error, "room cache eviction failed");
        }
    }

    /// Membership check for room-scoped events: the local cache first, then
    /// the durable participant set. Never reads the cached room copy and never
    /// marks the room joined locally.
    pub async fn authorize(
        &self,
        membership: &MembershipCache,
        user_id: Uuid,
        room_id: Uuid,
    ) -> Result<(), ChatError> {
        if membership.is_member(user_id, room_id) {
            return Ok(());
        }

        let Some(room) = self.durable.find_room(room_id).await? else {
            return Err(ChatError::new(ErrorKind::NotFound, "room not found"));
        };
        if !room.has_participant(user_id) {
            return Err(ChatError::from_kind(ErrorKind::RoomAccessDenied));
        }
        Ok(())
    }
}
