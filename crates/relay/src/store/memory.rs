use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parley_common::types::MessageKind;
use uuid::Uuid;

use super::{
    DurableStore, Message, MessagePage, NewMessage, NewRoom, Reader, Room, SessionRecord,
    StoreError, StoredFile, User,
};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<Uuid, SessionRecord>,
    rooms: HashMap<Uuid, Room>,
    messages: HashMap<Uuid, Message>,
    users: HashMap<Uuid, User>,
    files: HashMap<Uuid, StoredFile>,
}

/// In-process store used by tests and by the relay when no database is configured.
///
/// All mutations happen under one lock, which gives the same set semantics as
/// the SQL `ON CONFLICT DO NOTHING` / `DELETE` statements.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    user_lookups: AtomicUsize,
    file_lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched offline".into()));
        }
        Ok(())
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of batched `(user, file)` lookups served so far.
    pub fn lookup_counts(&self) -> (usize, usize) {
        (self.user_lookups.load(Ordering::SeqCst), self.file_lookups.load(Ordering::SeqCst))
    }

    pub fn insert_user(&self, name: &str, email: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            email: email.to_owned(),
            profile_image: None,
        };
        self.state().users.insert(user.id, user.clone());
        user
    }

    /// Create a room whose only participant is its creator.
    pub fn insert_room(&self, name: &str, creator_id: Uuid) -> Room {
        self.store_room(NewRoom { name: name.to_owned(), creator_id, password_hash: None })
    }

    fn store_room(&self, new_room: NewRoom) -> Room {
        let room = Room {
            id: Uuid::new_v4(),
            name: new_room.name,
            creator_id: new_room.creator_id,
            has_password: new_room.password_hash.is_some(),
            password_hash: new_room.password_hash,
            participant_ids: BTreeSet::from([new_room.creator_id]),
            created_at: Utc::now(),
        };
        self.state().rooms.insert(room.id, room.clone());
        room
    }

    pub fn insert_file(&self, original_name: &str, mime_type: &str, size: i64) -> StoredFile {
        let id = Uuid::new_v4();
        let file = StoredFile {
            id,
            filename: format!("{}-{original_name}", id.simple()),
            original_name: original_name.to_owned(),
            mime_type: mime_type.to_owned(),
            size,
        };
        self.state().files.insert(file.id, file.clone());
        file
    }

    pub fn insert_message_at(
        &self,
        room_id: Uuid,
        sender_id: Option<Uuid>,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Message {
        self.append_message(NewMessage {
            room_id,
            sender_id,
            content: content.to_owned(),
            kind: if sender_id.is_some() { MessageKind::User } else { MessageKind::System },
            timestamp,
            file_id: None,
            metadata: serde_json::Map::new(),
        })
    }

    pub fn attach_file(&self, message_id: Uuid, file_id: Uuid) {
        if let Some(message) = self.state().messages.get_mut(&message_id) {
            message.file_id = Some(file_id);
        }
    }

    pub fn soft_delete_message(&self, message_id: Uuid) {
        if let Some(message) = self.state().messages.get_mut(&message_id) {
            message.is_deleted = true;
        }
    }

    pub fn participant_ids(&self, room_id: Uuid) -> BTreeSet<Uuid> {
        self.state().rooms.get(&room_id).map(|room| room.participant_ids.clone()).unwrap_or_default()
    }

    /// Messages of a room in timeline order, including soft-deleted ones.
    pub fn room_messages(&self, room_id: Uuid) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .state()
            .messages
            .values()
            .filter(|message| message.room_id == room_id)
            .cloned()
            .collect();
        messages.sort_by_key(|message| (message.timestamp, message.id));
        messages
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    fn append_message(&self, new: NewMessage) -> Message {
        let mut state = self.state();
        let latest = state
            .messages
            .values()
            .filter(|message| message.room_id == new.room_id)
            .map(|message| message.timestamp)
            .max();
        // Per-room timestamps stay strictly increasing.
        let timestamp = match latest {
            Some(latest) if new.timestamp <= latest => latest + ChronoDuration::milliseconds(1),
            _ => new.timestamp,
        };

        let message = Message {
            id: Uuid::new_v4(),
            room_id: new.room_id,
            sender_id: new.sender_id,
            content: new.content,
            kind: new.kind,
            timestamp,
            is_deleted: false,
            reactions: BTreeMap::new(),
            readers: Vec::new(),
            file_id: new.file_id,
            metadata: new.metadata,
        };
        state.messages.insert(message.id, message.clone());
        message
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn upsert_session(&self, session: &SessionRecord) -> Result<SessionRecord, StoreError> {
        self.ensure_available()?;
        self.state().sessions.insert(session.user_id, session.clone());
        Ok(session.clone())
    }

    async fn find_session(&self, user_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        self.ensure_available()?;
        Ok(self.state().sessions.get(&user_id).cloned())
    }

    async fn touch_session(
        &self,
        user_id: Uuid,
        session_id: &str,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state();
        let Some(session) =
            state.sessions.get_mut(&user_id).filter(|session| session.session_id == session_id)
        else {
            return Ok(None);
        };
        session.last_activity = last_activity;
        session.expires_at = expires_at;
        Ok(Some(session.clone()))
    }

    async fn delete_session(
        &self,
        user_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let mut state = self.state();
        let matches = state
            .sessions
            .get(&user_id)
            .is_some_and(|session| session_id.map_or(true, |id| session.session_id == id));
        if matches {
            state.sessions.remove(&user_id);
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn find_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        self.ensure_available()?;
        Ok(self.state().rooms.get(&room_id).cloned())
    }

    async fn create_room(&self, room: NewRoom) -> Result<Room, StoreError> {
        self.ensure_available()?;
        Ok(self.store_room(room))
    }

    async fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.ensure_available()?;
        match self.state().rooms.get_mut(&room_id) {
            Some(room) => Ok(room.participant_ids.insert(user_id)),
            None => Err(StoreError::Corrupt(format!("room {room_id} does not exist"))),
        }
    }

    async fn remove_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.ensure_available()?;
        Ok(self
            .state()
            .rooms
            .get_mut(&room_id)
            .is_some_and(|room| room.participant_ids.remove(&user_id)))
    }

    async fn find_messages_page(
        &self,
        room_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<MessagePage, StoreError> {
        self.ensure_available()?;
        let mut candidates: Vec<Message> = self
            .state()
            .messages
            .values()
            .filter(|message| {
                message.room_id == room_id && !message.is_deleted && message.timestamp < before
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));

        let has_more = candidates.len() > limit;
        candidates.truncate(limit);
        Ok(MessagePage { messages: candidates, has_more })
    }

    async fn find_messages_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Message>, StoreError> {
        self.ensure_available()?;
        let state = self.state();
        Ok(ids.iter().filter_map(|id| state.messages.get(id).cloned()).collect())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.ensure_available()?;
        Ok(self.append_message(message))
    }

    async fn mark_read(
        &self,
        message_ids: &[Uuid],
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let mut state = self.state();
        let mut appended = 0;
        for id in message_ids {
            let Some(message) = state.messages.get_mut(id) else {
                continue;
            };
            if message.readers.iter().any(|reader| reader.user_id == user_id) {
                continue;
            }
            message.readers.push(Reader { user_id, read_at });
            appended += 1;
        }
        Ok(appended)
    }

    async fn find_users_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>, StoreError> {
        self.ensure_available()?;
        self.user_lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        Ok(ids.iter().filter_map(|id| state.users.get(id).cloned()).collect())
    }

    async fn find_files_by_ids(&self, ids: &[Uuid]) -> Result<Vec<StoredFile>, StoreError> {
        self.ensure_available()?;
        self.file_lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        Ok(ids.iter().filter_map(|id| state.files.get(id).cloned()).collect())
    }
}
