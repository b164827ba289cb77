use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parley_common::protocol::{error::ErrorKind, ws::ServerEvent};
use parley_common::types::{MessageView, UserView};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, ConnectionId};
use crate::error::ChatError;
use crate::messages::mapper::to_view;
use crate::messages::{LoadedPage, MessageLoader};
use crate::metrics;
use crate::store::{DurableStore, NewMessage, Room, User};

use super::directory::RoomDirectory;
use super::membership::{JoinStart, MembershipCache};

/// Drives `JOIN_ROOM` / `LEAVE_ROOM` for one connection at a time.
///
/// A join moves `(user, room)` from not joined, through a local reservation,
/// to confirmed. Any error (or cancellation of the join future) drops the
/// reservation, so peers never observe a half-finished join.
pub struct JoinHandler {
    store: Arc<dyn DurableStore>,
    rooms: Arc<RoomDirectory>,
    membership: Arc<MembershipCache>,
    broadcast: Arc<dyn BroadcastGroup>,
    loader: Arc<MessageLoader>,
}

impl JoinHandler {
    pub fn new(
        store: Arc<dyn DurableStore>,
        rooms: Arc<RoomDirectory>,
        membership: Arc<MembershipCache>,
        broadcast: Arc<dyn BroadcastGroup>,
        loader: Arc<MessageLoader>,
    ) -> Self {
        Self { store, rooms, membership, broadcast, loader }
    }

    /// Returns the `JOIN_ROOM_SUCCESS` reply for the requester. Room-wide
    /// events are published before returning.
    pub async fn handle_join(
        &self,
        user_id: Uuid,
        connection_id: ConnectionId,
        room_id: Uuid,
    ) -> Result<ServerEvent, ChatError> {
        let span = info_span!("parley.rooms.join", user_id = %user_id, room_id = %room_id);
        let result = self.join(user_id, connection_id, room_id).instrument(span).await;
        if result.is_err() {
            metrics::record_room_join("failed");
        }
        result
    }

    async fn join(
        &self,
        user_id: Uuid,
        connection_id: ConnectionId,
        room_id: Uuid,
    ) -> Result<ServerEvent, ChatError> {
        let user = self.resolve_user(user_id).await?;
        if self.rooms.find_room(room_id).await?.is_none() {
            return Err(ChatError::new(ErrorKind::NotFound, "room not found"));
        }

        let mut guard = match self.membership.begin_join(
            user_id,
            room_id,
            connection_id,
            Arc::clone(&self.broadcast),
        ) {
            JoinStart::Reserved(guard) => guard,
            JoinStart::AlreadyJoined => {
                self.broadcast.subscribe(room_id, connection_id);
                metrics::record_room_join("rejoined");
                return Ok(ServerEvent::JoinRoomSuccess {
                    room_id,
                    participants: Vec::new(),
                    messages: Vec::new(),
                    has_more: false,
                });
            }
            JoinStart::InProgress => {
                return Err(ChatError::new(ErrorKind::ValidationFailed, "join already in progress"));
            }
        };

        let inserted = self.rooms.add_participant(room_id, user_id).await?;
        guard.subscribe();

        let announcement = if inserted {
            Some(self.announce(room_id, format!("{} joined", user.name)).await?)
        } else {
            None
        };

        let page = match self.loader.load_messages(room_id, None, None, Some(user_id)).await {
            Ok(page) => page,
            Err(error) => {
                warn!(error = %error, "history load failed during join, sending empty page");
                LoadedPage::default()
            }
        };

        let participants = self.participants(room_id).await?;

        guard.commit();
        metrics::record_room_join(if inserted { "joined" } else { "restored" });
        info!(inserted, participants = participants.len(), "room joined");

        if let Some(message) = announcement {
            self.broadcast.publish(room_id, &ServerEvent::Message { message });
        }
        self.broadcast.publish(
            room_id,
            &ServerEvent::ParticipantsUpdate { room_id, participants: participants.clone() },
        );

        Ok(ServerEvent::JoinRoomSuccess {
            room_id,
            participants,
            messages: page.messages,
            has_more: page.has_more,
        })
    }

    /// Leaving a room the user is not in still succeeds, without side effects.
    pub async fn handle_leave(&self, user_id: Uuid, room_id: Uuid) -> Result<ServerEvent, ChatError> {
        let span = info_span!("parley.rooms.leave", user_id = %user_id, room_id = %room_id);
        async move {
            let user = self.resolve_user(user_id).await?;
            if self.rooms.find_room(room_id).await?.is_none() {
                return Err(ChatError::new(ErrorKind::NotFound, "room not found"));
            }

            let removed = self.rooms.remove_participant(room_id, user_id).await?;
            self.membership.remove(user_id, room_id);
            for connection_id in self.membership.connections_of(user_id) {
                self.broadcast.unsubscribe(room_id, connection_id);
            }

            if removed {
                let message = self.announce(room_id, format!("{} left", user.name)).await?;
                let participants = self.participants(room_id).await?;
                self.broadcast.publish(room_id, &ServerEvent::Message { message });
                self.broadcast.publish(room_id, &ServerEvent::ParticipantsUpdate { room_id, participants });
                info!("room left");
            }

            Ok(ServerEvent::LeaveRoomSuccess { room_id })
        }
        .instrument(span)
        .await
    }

    async fn resolve_user(&self, user_id: Uuid) -> Result<User, ChatError> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or_else(|| ChatError::new(ErrorKind::Unauthorized, "user not found"))
    }

    async fn announce(&self, room_id: Uuid, content: String) -> Result<MessageView, ChatError> {
        let stored = self.store.insert_message(NewMessage::system(room_id, content, Utc::now())).await?;
        Ok(to_view(&stored, &HashMap::new(), &HashMap::new()))
    }

    /// Current participants, read from the durable store after the mutation
    /// and resolved with one batched user lookup.
    async fn participants(&self, room_id: Uuid) -> Result<Vec<UserView>, ChatError> {
        let room: Room = self
            .store
            .find_room(room_id)
            .await?
            .ok_or_else(|| ChatError::new(ErrorKind::NotFound, "room not found"))?;
        let ids: Vec<Uuid> = room.participant_ids.iter().copied().collect();
        let users = self.store.find_users_by_ids(&ids).await?;
        Ok(users.iter().map(UserView::from).collect())
    }
}
