// Read-side views shared by the relay and its clients.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who or what produced a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    System,
    Ai,
}

impl MessageKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Ai => "ai",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "system" => Some(Self::System),
            "ai" => Some(Self::Ai),
            _ => None,
        }
    }
}

/// Public projection of a user, as shown in participant lists and message senders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

/// Attachment metadata rendered alongside a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileView {
    pub id: Uuid,
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
}

/// One entry of a message's read-receipt list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReaderView {
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

/// A message as delivered to clients: sender and file already resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub room_id: Uuid,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileView>,
    #[serde(default)]
    pub reactions: BTreeMap<String, Vec<Uuid>>,
    #[serde(default)]
    pub readers: Vec<ReaderView>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}
