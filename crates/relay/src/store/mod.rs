// Durable store adapter: sessions, rooms, messages and batched user/file lookups.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::types::{FileView, MessageKind, ReaderView, UserView};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable store call `{operation}` timed out")]
    Timeout { operation: &'static str },

    #[error("durable store unavailable: {0}")]
    Unavailable(String),

    #[error("durable store row could not be decoded: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub device_info: Option<String>,
}

/// The single authoritative login of a user. Keyed by `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user_id: Uuid,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub creator_id: Uuid,
    pub has_password: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    pub participant_ids: BTreeSet<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participant_ids.contains(&user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reader {
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub is_deleted: bool,
    pub reactions: BTreeMap<String, Vec<Uuid>>,
    /// Append-only, ordered by `read_at`.
    pub readers: Vec<Reader>,
    pub file_id: Option<Uuid>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub file_id: Option<Uuid>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NewMessage {
    pub fn system(room_id: Uuid, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            room_id,
            sender_id: None,
            content: content.into(),
            kind: MessageKind::System,
            timestamp,
            file_id: None,
            metadata: serde_json::Map::new(),
        }
    }
}

/// A room to create. The creator becomes its first participant. A password
/// hash, when present, is computed by the caller.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub name: String,
    pub creator_id: Uuid,
    pub password_hash: Option<String>,
}

/// One backward page of a room timeline, newest first.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub profile_image: Option<String>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            profile_image: user.profile_image.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: Uuid,
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
}

impl From<&StoredFile> for FileView {
    fn from(file: &StoredFile) -> Self {
        Self {
            id: file.id,
            filename: file.filename.clone(),
            original_name: file.original_name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.size,
        }
    }
}

impl From<&Reader> for ReaderView {
    fn from(reader: &Reader) -> Self {
        Self { user_id: reader.user_id, read_at: reader.read_at }
    }
}

/// Durable persistence for everything the realtime pipeline touches.
///
/// Participant sets are only mutated through [`add_participant`] and
/// [`remove_participant`], never by rewriting a whole room.
///
/// [`add_participant`]: DurableStore::add_participant
/// [`remove_participant`]: DurableStore::remove_participant
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or replace the session owned by `session.user_id`.
    async fn upsert_session(&self, session: &SessionRecord) -> Result<SessionRecord, StoreError>;

    async fn find_session(&self, user_id: Uuid) -> Result<Option<SessionRecord>, StoreError>;

    /// Advance activity for the session only if it still carries `session_id`.
    async fn touch_session(
        &self,
        user_id: Uuid,
        session_id: &str,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Delete the user's session, or only the one matching `session_id`.
    async fn delete_session(&self, user_id: Uuid, session_id: Option<&str>)
        -> Result<u64, StoreError>;

    async fn find_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError>;

    /// Insert the room together with its creator as the only participant.
    async fn create_room(&self, room: NewRoom) -> Result<Room, StoreError>;

    /// Returns `true` when the participant was newly inserted.
    async fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;

    /// Returns `true` when the participant was present and got removed.
    async fn remove_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;

    /// Up to `limit` non-deleted messages strictly before `before`, newest first.
    async fn find_messages_page(
        &self,
        room_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<MessagePage, StoreError>;

    async fn find_messages_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Message>, StoreError>;

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Append `user_id` to the readers of each message unless already there.
    async fn mark_read(
        &self,
        message_ids: &[Uuid],
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn find_users_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>, StoreError>;

    async fn find_files_by_ids(&self, ids: &[Uuid]) -> Result<Vec<StoredFile>, StoreError>;

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.find_users_by_ids(&[user_id]).await?.into_iter().next())
    }
}

async fn within<T, F>(timeout: Duration, operation: &'static str, future: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { operation }),
    }
}

/// Wraps another store so that no call can outlive `timeout`.
pub struct DeadlineStore {
    inner: Arc<dyn DurableStore>,
    timeout: Duration,
}

impl DeadlineStore {
    pub fn new(inner: Arc<dyn DurableStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl DurableStore for DeadlineStore {
    async fn upsert_session(&self, session: &SessionRecord) -> Result<SessionRecord, StoreError> {
        within(self.timeout, "upsert_session", self.inner.upsert_session(session)).await
    }

    async fn find_session(&self, user_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        within(self.timeout, "find_session", self.inner.find_session(user_id)).await
    }

    async fn touch_session(
        &self,
        user_id: Uuid,
        session_id: &str,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, StoreError> {
        within(
            self.timeout,
            "touch_session",
            self.inner.touch_session(user_id, session_id, last_activity, expires_at),
        )
        .await
    }

    async fn delete_session(
        &self,
        user_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        within(self.timeout, "delete_session", self.inner.delete_session(user_id, session_id)).await
    }

    async fn find_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        within(self.timeout, "find_room", self.inner.find_room(room_id)).await
    }

    async fn create_room(&self, room: NewRoom) -> Result<Room, StoreError> {
        within(self.timeout, "create_room", self.inner.create_room(room)).await
    }

    async fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        within(self.timeout, "add_participant", self.inner.add_participant(room_id, user_id)).await
    }

    async fn remove_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        within(self.timeout, "remove_participant", self.inner.remove_participant(room_id, user_id))
            .await
    }

    async fn find_messages_page(
        &self,
        room_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<MessagePage, StoreError> {
        within(
            self.timeout,
            "find_messages_page",
            self.inner.find_messages_page(room_id, before, limit),
        )
        .await
    }

    async fn find_messages_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Message>, StoreError> {
        within(self.timeout, "find_messages_by_ids", self.inner.find_messages_by_ids(ids)).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        within(self.timeout, "insert_message", self.inner.insert_message(message)).await
    }

    async fn mark_read(
        &self,
        message_ids: &[Uuid],
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        within(self.timeout, "mark_read", self.inner.mark_read(message_ids, user_id, read_at)).await
    }

    async fn find_users_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>, StoreError> {
        within(self.timeout, "find_users_by_ids", self.inner.find_users_by_ids(ids)).await
    }

    async fn find_files_by_ids(&self, ids: &[Uuid]) -> Result<Vec<StoredFile>, StoreError> {
        within(self.timeout, "find_files_by_ids", self.inner.find_files_by_ids(ids)).await
    }
}
