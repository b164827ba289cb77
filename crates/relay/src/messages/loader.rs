use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_common::types::MessageView;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::FileCache;
use crate::error::ChatError;
use crate::store::{DurableStore, Reader};

use super::mapper::{index_by_id, to_view};

pub const MAX_PAGE_SIZE: u32 = 100;

/// One page of a room timeline in ascending order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedPage {
    pub messages: Vec<MessageView>,
    pub has_more: bool,
}

pub struct MessageLoader {
    store: Arc<dyn DurableStore>,
    files: Arc<FileCache>,
    default_limit: u32,
}

impl MessageLoader {
    pub fn new(store: Arc<dyn DurableStore>, files: Arc<FileCache>, default_limit: u32) -> Self {
        Self { store, files, default_limit: default_limit.clamp(1, MAX_PAGE_SIZE) }
    }

    pub fn default_limit(&self) -> u32 {
        self.default_limit
    }

    /// Load up to `limit` visible messages older than `before`.
    ///
    /// Senders resolve with one batched user lookup and attachments through
    /// the file cache. When `reader` is set, every returned message is marked
    /// read by that user in one batched write; a failure there is logged only.
    pub async fn load_messages(
        &self,
        room_id: Uuid,
        limit: Option<u32>,
        before: Option<DateTime<Utc>>,
        reader: Option<Uuid>,
    ) -> Result<LoadedPage, ChatError> {
        let limit = limit.unwrap_or(self.default_limit).clamp(1, MAX_PAGE_SIZE);
        let before = before.unwrap_or_else(Utc::now);
        let span = info_span!("parley.messages.load", room_id = %room_id, limit);

        async move {
            let page = self.store.find_messages_page(room_id, before, limit as usize).await?;
            let mut messages = page.messages;
            messages.reverse();

            let mut sender_ids = HashSet::new();
            let mut file_ids = HashSet::new();
            let mut message_ids = Vec::with_capacity(messages.len());
            for message in &messages {
                message_ids.push(message.id);
                sender_ids.extend(message.sender_id);
                file_ids.extend(message.file_id);
            }

            if let (Some(user_id), false) = (reader, message_ids.is_empty()) {
                let read_at = Utc::now();
                match self.store.mark_read(&message_ids, user_id, read_at).await {
                    Ok(_) => {
                        for message in &mut messages {
                            if !message.readers.iter().any(|r| r.user_id == user_id) {
                                message.readers.push(Reader { user_id, read_at });
                            }
                        }
                    }
                    Err(error) => {
                        warn!(room_id = %room_id, user_id = %user_id, error = %error, "failed to record page reads");
                    }
                }
            }

            let users = if sender_ids.is_empty() {
                Default::default()
            } else {
                let ids: Vec<Uuid> = sender_ids.into_iter().collect();
                index_by_id(self.store.find_users_by_ids(&ids).await?, |user| user.id)
            };
            let files = self.files.get_files(self.store.as_ref(), file_ids).await?;

            Ok::<_, ChatError>(LoadedPage {
                messages: messages.iter().map(|message| to_view(message, &users, &files)).collect(),
                has_more: page.has_more,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;

    fn loader(store: Arc<MemoryStore>) -> MessageLoader {
        MessageLoader::new(store, Arc::new(FileCache::new(16, Duration::from_secs(60))), 30)
    }

    #[tokio::test]
    async fn page_is_ascending_bounded_and_flags_more() {
        let store = Arc::new(MemoryStore::new());
        let author = store.insert_user("Ana", "ana@example.com");
        let room = store.insert_room("general", author.id);
        let base = Utc::now() - chrono::Duration::minutes(10);
        for i in 0..35 {
            store.insert_message_at(room.id, Some(author.id), &format!("m{i}"), base + chrono::Duration::seconds(i));
        }
        let cutoff = base + chrono::Duration::seconds(33);

        let page = loader(store).load_messages(room.id, Some(30), Some(cutoff), None).await.expect("load");

        assert_eq!(page.messages.len(), 30);
        assert!(page.has_more);
        assert_eq!(page.messages.first().map(|m| m.content.as_str()), Some("m3"));
        assert_eq!(page.messages.last().map(|m| m.content.as_str()), Some("m32"));
        assert!(page.messages.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
        assert!(page.messages.iter().all(|m| m.timestamp < cutoff.timestamp_millis()));
    }

    #[tokio::test]
    async fn short_history_has_no_more() {
        let store = Arc::new(MemoryStore::new());
        let author = store.insert_user("Ana", "ana@example.com");
        let room = store.insert_room("general", author.id);
        store.insert_message_at(room.id, Some(author.id), "only", Utc::now() - chrono::Duration::seconds(1));

        let page = loader(store).load_messages(room.id, None, None, None).await.expect("load");
        assert_eq!(page.messages.len(), 1);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn exactly_limit_messages_has_no_more() {
        let store = Arc::new(MemoryStore::new());
        let author = store.insert_user("Ana", "ana@example.com");
        let room = store.insert_room("general", author.id);
        let base = Utc::now() - chrono::Duration::minutes(10);
        for i in 0..30 {
            store.insert_message_at(room.id, Some(author.id), &format!("m{i}"), base + chrono::Duration::seconds(i));
        }
        let loader = loader(store.clone());

        let page = loader.load_messages(room.id, Some(30), None, None).await.expect("load");
        assert_eq!(page.messages.len(), 30);
        assert!(!page.has_more);

        store.insert_message_at(room.id, Some(author.id), "m30", base + chrono::Duration::seconds(30));
        let page = loader.load_messages(room.id, Some(30), None, None).await.expect("load");
        assert_eq!(page.messages.len(), 30);
        assert!(page.has_more);
        assert_eq!(page.messages.first().map(|m| m.content.as_str()), Some("m1"));
    }

    #[tokio::test]
    async fn senders_and_files_resolve_in_single_batches() {
        let store = Arc::new(MemoryStore::new());
        let ana = store.insert_user("Ana", "ana@example.com");
        let ben = store.insert_user("Ben", "ben@example.com");
        let room = store.insert_room("general", ana.id);
        let file = store.insert_file("notes.pdf", "application/pdf", 2048);
        let base = Utc::now() - chrono::Duration::minutes(1);
        for i in 0..6 {
            let sender = if i % 2 == 0 { ana.id } else { ben.id };
            let message = store.insert_message_at(room.id, Some(sender), "hi", base + chrono::Duration::seconds(i));
            store.attach_file(message.id, file.id);
        }

        let page = loader(store.clone()).load_messages(room.id, None, None, None).await.expect("load");

        assert_eq!(store.lookup_counts(), (1, 1));
        assert!(page.messages.iter().all(|m| m.sender.is_some()));
        assert!(page.messages.iter().all(|m| m.file.as_ref().map(|f| f.id) == Some(file.id)));
    }

    #[tokio::test]
    async fn soft_deleted_messages_are_hidden() {
        let store = Arc::new(MemoryStore::new());
        let ana = store.insert_user("Ana", "ana@example.com");
        let room = store.insert_room("general", ana.id);
        let base = Utc::now() - chrono::Duration::minutes(1);
        store.insert_message_at(room.id, Some(ana.id), "kept", base);
        let gone = store.insert_message_at(room.id, Some(ana.id), "gone", base + chrono::Duration::seconds(1));
        store.soft_delete_message(gone.id);

        let page = loader(store).load_messages(room.id, None, None, None).await.expect("load");
        let contents: Vec<&str> = page.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["kept"]);
    }

    #[tokio::test]
    async fn reader_is_recorded_once_per_message() {
        let store = Arc::new(MemoryStore::new());
        let ana = store.insert_user("Ana", "ana@example.com");
        let ben = store.insert_user("Ben", "ben@example.com");
        let room = store.insert_room("general", ana.id);
        store.insert_message_at(room.id, Some(ana.id), "hi", Utc::now() - chrono::Duration::seconds(5));
        let loader = loader(store.clone());

        let first = loader.load_messages(room.id, None, None, Some(ben.id)).await.expect("load");
        loader.load_messages(room.id, None, None, Some(ben.id)).await.expect("reload");

        assert_eq!(first.messages[0].readers.len(), 1);
        let stored = store.room_messages(room.id);
        assert_eq!(stored[0].readers.iter().filter(|r| r.user_id == ben.id).count(), 1);
    }
}
