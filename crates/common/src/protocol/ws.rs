// WebSocket event types for the parley realtime protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::error::ErrorKind;
use crate::types::{MessageView, UserView};

/// Events a client may send after the socket is upgraded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// First frame on every socket: binds the connection to a user session.
    Hello { access_token: String, session_id: String },

    JoinRoom { room_id: Uuid },

    LeaveRoom { room_id: Uuid },

    ChatMessage {
        room_id: Uuid,
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<Uuid>,
    },

    /// Page backward through a room timeline. `before` is epoch milliseconds.
    FetchPreviousMessages {
        room_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    MarkMessagesAsRead {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<Uuid>,
        message_ids: Vec<Uuid>,
    },
}

impl ClientEvent {
    /// Short label used for logs and per-event metrics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::ChatMessage { .. } => "chat_message",
            Self::FetchPreviousMessages { .. } => "fetch_previous_messages",
            Self::MarkMessagesAsRead { .. } => "mark_messages_as_read",
        }
    }
}

/// Events pushed by the relay, either as replies or room broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    HelloAck {
        user_id: Uuid,
        server_time: String,
    },

    JoinRoomSuccess {
        room_id: Uuid,
        participants: Vec<UserView>,
        messages: Vec<MessageView>,
        has_more: bool,
    },

    JoinRoomError {
        kind: ErrorKind,
        message: String,
    },

    LeaveRoomSuccess {
        room_id: Uuid,
    },

    /// Broadcast: a new message in a room the receiver has joined.
    Message {
        message: MessageView,
    },

    /// Broadcast: the authoritative participant list changed.
    ParticipantsUpdate {
        room_id: Uuid,
        participants: Vec<UserView>,
    },

    /// Broadcast: `user_id` has read `message_ids`.
    MessagesRead {
        user_id: Uuid,
        message_ids: Vec<Uuid>,
    },

    PreviousMessagesLoaded {
        room_id: Uuid,
        messages: Vec<MessageView>,
        has_more: bool,
    },

    Error {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl ServerEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error { kind, message: message.into(), retryable: kind.retryable() }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed event frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("binary frames are not supported")]
    Binary,
}

pub fn decode_client_event(raw: &str) -> Result<ClientEvent, FrameError> {
    Ok(serde_json::from_str::<ClientEvent>(raw)?)
}

pub fn encode_server_event(event: &ServerEvent) -> Result<String, FrameError> {
    Ok(serde_json::to_string(event)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageKind;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn decodes_join_room_with_camel_case_field() {
        let room_id = Uuid::new_v4();
        let raw = json!({ "type": "JOIN_ROOM", "roomId": room_id }).to_string();

        let event = decode_client_event(&raw).expect("join frame should decode");
        assert_eq!(event, ClientEvent::JoinRoom { room_id });
        assert_eq!(event.name(), "join_room");
    }

    #[test]
    fn mark_as_read_room_id_is_optional() {
        let message_id = Uuid::new_v4();
        let raw = json!({ "type": "MARK_MESSAGES_AS_READ", "messageIds": [message_id] }).to_string();

        let event = decode_client_event(&raw).expect("mark-as-read frame should decode");
        assert_eq!(event, ClientEvent::MarkMessagesAsRead { room_id: None, message_ids: vec![message_id] });
    }

    #[test]
    fn rejects_unknown_event_types() {
        let error = decode_client_event(r#"{"type":"SUBSCRIBE","docId":"x"}"#)
            .expect_err("unknown type should fail");
        assert!(matches!(error, FrameError::Malformed(_)));
    }

    #[test]
    fn message_broadcast_nests_view_beside_type_tag() {
        let view = MessageView {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            content: "B joined".into(),
            kind: MessageKind::System,
            timestamp: 42,
            sender: None,
            file: None,
            reactions: BTreeMap::new(),
            readers: Vec::new(),
            metadata: serde_json::Map::new(),
        };

        let event = ServerEvent::Message { message: view };
        let encoded = encode_server_event(&event).expect("message event should encode");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("valid json");

        assert_eq!(value["type"], "MESSAGE");
        assert_eq!(value["message"]["type"], "system");
        assert_eq!(value["message"]["content"], "B joined");

        let decoded: ServerEvent = serde_json::from_str(&encoded).expect("event should decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn error_event_carries_stable_kind_and_retryable_flag() {
        let encoded = encode_server_event(&ServerEvent::error(ErrorKind::StoreUnavailable, "db down"))
            .expect("error event should encode");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("valid json");

        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["kind"], "STORE_UNAVAILABLE");
        assert_eq!(value["retryable"], true);
    }
}
