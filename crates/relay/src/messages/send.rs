use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parley_common::protocol::{error::ErrorKind, ws::ServerEvent};
use parley_common::types::{MessageKind, MessageView};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::cache::FileCache;
use crate::error::ChatError;
use crate::rooms::{MembershipCache, RoomDirectory};
use crate::store::{DurableStore, NewMessage};

use super::loader::{LoadedPage, MessageLoader};
use super::mapper::{index_by_id, to_view};

pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Posting and history reads for rooms the caller participates in.
pub struct MessageService {
    store: Arc<dyn DurableStore>,
    files: Arc<FileCache>,
    rooms: Arc<RoomDirectory>,
    membership: Arc<MembershipCache>,
    broadcast: Arc<dyn BroadcastGroup>,
    loader: Arc<MessageLoader>,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn DurableStore>,
        files: Arc<FileCache>,
        rooms: Arc<RoomDirectory>,
        membership: Arc<MembershipCache>,
        broadcast: Arc<dyn BroadcastGroup>,
        loader: Arc<MessageLoader>,
    ) -> Self {
        Self { store, files, rooms, membership, broadcast, loader }
    }

    pub async fn send_message(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        content: &str,
        file_id: Option<Uuid>,
    ) -> Result<MessageView, ChatError> {
        let content = content.trim();
        if content.is_empty() && file_id.is_none() {
            return Err(ChatError::new(ErrorKind::ValidationFailed, "message content is empty"));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(ChatError::new(
                ErrorKind::ValidationFailed,
                format!("message content exceeds {MAX_CONTENT_CHARS} characters"),
            ));
        }

        self.rooms.authorize(&self.membership, user_id, room_id).await?;

        let Some(sender) = self.store.find_user(user_id).await? else {
            return Err(ChatError::new(ErrorKind::Unauthorized, "user not found"));
        };
        let files = match file_id {
            Some(id) => {
                let files = self.files.get_files(self.store.as_ref(), [id]).await?;
                if !files.contains_key(&id) {
                    return Err(ChatError::new(ErrorKind::NotFound, "file not found"));
                }
                files
            }
            None => HashMap::new(),
        };

        let stored = self
            .store
            .insert_message(NewMessage {
                room_id,
                sender_id: Some(user_id),
                content: content.to_owned(),
                kind: MessageKind::User,
                timestamp: Utc::now(),
                file_id,
                metadata: serde_json::Map::new(),
            })
            .instrument(info_span!("parley.messages.send", room_id = %room_id, user_id = %user_id))
            .await?;

        let users = index_by_id(vec![sender], |user| user.id);
        let view = to_view(&stored, &users, &files);
        self.broadcast.publish(room_id, &ServerEvent::Message { message: view.clone() });
        Ok(view)
    }

    /// `before` is milliseconds since the epoch; an out-of-range value is rejected.
    pub async fn fetch_previous(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        before: Option<i64>,
        limit: Option<u32>,
    ) -> Result<LoadedPage, ChatError> {
        let before = before.map(millis_to_datetime).transpose()?;
        self.rooms.authorize(&self.membership, user_id, room_id).await?;
        self.loader.load_messages(room_id, limit, before, Some(user_id)).await
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, ChatError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ChatError::new(ErrorKind::ValidationFailed, "`before` is not a valid timestamp"))
}
