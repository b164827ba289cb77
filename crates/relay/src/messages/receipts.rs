use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parley_common::protocol::{error::ErrorKind, ws::ServerEvent};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::error::ChatError;
use crate::rooms::{MembershipCache, RoomDirectory};
use crate::store::DurableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptDispatch {
    /// Persist and broadcast before the caller gets a reply.
    Inline,
    /// Persist and broadcast on a spawned task after authorization.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Skipped,
    Dispatched { room_id: Uuid, message_ids: Vec<Uuid> },
}

pub struct ReadReceiptService {
    store: Arc<dyn DurableStore>,
    rooms: Arc<RoomDirectory>,
    membership: Arc<MembershipCache>,
    broadcast: Arc<dyn BroadcastGroup>,
    dispatch: ReceiptDispatch,
}

impl ReadReceiptService {
    pub fn new(
        store: Arc<dyn DurableStore>,
        rooms: Arc<RoomDirectory>,
        membership: Arc<MembershipCache>,
        broadcast: Arc<dyn BroadcastGroup>,
        dispatch: ReceiptDispatch,
    ) -> Self {
        Self { store, rooms, membership, broadcast, dispatch }
    }

    /// Record that `user_id` has read `message_ids`.
    ///
    /// The owning room comes from `room_id` or, when absent, from the first
    /// resolvable message. Ids belonging to another room are ignored.
    pub async fn mark_as_read(
        &self,
        user_id: Uuid,
        room_id: Option<Uuid>,
        message_ids: &[Uuid],
    ) -> Result<ReceiptOutcome, ChatError> {
        let mut seen = HashSet::new();
        let requested: Vec<Uuid> = message_ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if requested.is_empty() {
            return Ok(ReceiptOutcome::Skipped);
        }

        let messages = self
            .store
            .find_messages_by_ids(&requested)
            .instrument(info_span!("parley.receipts.resolve", user_id = %user_id))
            .await?;
        let Some(room_id) = room_id.or_else(|| messages.first().map(|message| message.room_id)) else {
            return Err(ChatError::new(ErrorKind::NotFound, "message not found"));
        };

        self.rooms.authorize(&self.membership, user_id, room_id).await?;

        let message_ids: Vec<Uuid> = messages
            .iter()
            .filter(|message| message.room_id == room_id)
            .map(|message| message.id)
            .collect();
        if message_ids.is_empty() {
            return Err(ChatError::new(ErrorKind::NotFound, "message not found"));
        }

        match self.dispatch {
            ReceiptDispatch::Inline => {
                persist_and_announce(self.store.as_ref(), self.broadcast.as_ref(), user_id, room_id, &message_ids)
                    .await?;
            }
            ReceiptDispatch::Deferred => {
                let store = Arc::clone(&self.store);
                let broadcast = Arc::clone(&self.broadcast);
                let ids = message_ids.clone();
                tokio::spawn(async move {
                    if let Err(error) =
                        persist_and_announce(store.as_ref(), broadcast.as_ref(), user_id, room_id, &ids).await
                    {
                        warn!(user_id = %user_id, room_id = %room_id, error = %error, "deferred read receipt failed");
                    }
                });
            }
        }

        Ok(ReceiptOutcome::Dispatched { room_id, message_ids })
    }
}

async fn persist_and_announce(
    store: &dyn DurableStore,
    broadcast: &dyn BroadcastGroup,
    user_id: Uuid,
    room_id: Uuid,
    message_ids: &[Uuid],
) -> Result<(), ChatError> {
    store
        .mark_read(message_ids, user_id, Utc::now())
        .instrument(info_span!("parley.receipts.persist", user_id = %user_id, room_id = %room_id))
        .await?;
    broadcast.publish(room_id, &ServerEvent::MessagesRead { user_id, message_ids: message_ids.to_vec() });
    Ok(())
}
