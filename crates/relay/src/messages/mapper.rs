use std::collections::HashMap;

use parley_common::types::{MessageView, ReaderView, UserView};
use uuid::Uuid;

use crate::store::{Message, StoredFile, User};

/// Project a stored message into its wire view. Lookups are by id; a sender
/// or file missing from the maps is rendered as absent.
pub fn to_view(
    message: &Message,
    users: &HashMap<Uuid, User>,
    files: &HashMap<Uuid, StoredFile>,
) -> MessageView {
    MessageView {
        id: message.id,
        room_id: message.room_id,
        content: message.content.clone(),
        kind: message.kind,
        timestamp: message.timestamp.timestamp_millis(),
        sender: message.sender_id.and_then(|id| users.get(&id)).map(UserView::from),
        file: message.file_id.and_then(|id| files.get(&id)).map(Into::into),
        reactions: message.reactions.clone(),
        readers: message.readers.iter().map(ReaderView::from).collect(),
        metadata: message.metadata.clone(),
    }
}

pub fn index_by_id<T, F>(items: Vec<T>, id: F) -> HashMap<Uuid, T>
where
    F: Fn(&T) -> Uuid,
{
    items.into_iter().map(|item| (id(&item), item)).collect()
}
