use parley_common::protocol::{error::ErrorKind, ws::ClientEvent, ws::ServerEvent};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::broadcast::ConnectionId;
use crate::error::ChatError;
use crate::metrics;
use crate::state::AppState;

/// An authenticated socket.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: Uuid,
}

/// Handle one client event and return the direct reply, if any. Room-wide
/// effects are delivered through the broadcast hub.
pub async fn dispatch(state: &AppState, connection: &Connection, event: ClientEvent) -> Option<ServerEvent> {
    let started_at = Instant::now();
    let name = event.name();
    let is_join = matches!(event, ClientEvent::JoinRoom { .. });

    let result = handle(state, connection, event).await;
    metrics::record_ws_request(name, result.is_err(), started_at.elapsed().as_millis() as u64);

    match result {
        Ok(reply) => {
            state.sessions.update_last_activity(connection.user_id).await;
            reply
        }
        Err(error) => {
            debug!(event = name, kind = %error.kind(), message = error.message(), "event rejected");
            Some(if is_join { error.to_join_error_event() } else { error.to_event() })
        }
    }
}

async fn handle(
    state: &AppState,
    connection: &Connection,
    event: ClientEvent,
) -> Result<Option<ServerEvent>, ChatError> {
    let user_id = connection.user_id;
    match event {
        ClientEvent::Hello { .. } => {
            Err(ChatError::new(ErrorKind::ValidationFailed, "connection is already authenticated"))
        }
        ClientEvent::JoinRoom { room_id } => {
            state.joins.handle_join(user_id, connection.id, room_id).await.map(Some)
        }
        ClientEvent::LeaveRoom { room_id } => state.joins.handle_leave(user_id, room_id).await.map(Some),
        ClientEvent::ChatMessage { room_id, content, file_id } => {
            state.messages.send_message(user_id, room_id, &content, file_id).await?;
            Ok(None)
        }
        ClientEvent::FetchPreviousMessages { room_id, before, limit } => {
            let page = state.messages.fetch_previous(user_id, room_id, before, limit).await?;
            Ok(Some(ServerEvent::PreviousMessagesLoaded {
                room_id,
                messages: page.messages,
                has_more: page.has_more,
            }))
        }
        ClientEvent::MarkMessagesAsRead { room_id, message_ids } => {
            state.receipts.mark_as_read(user_id, room_id, &message_ids).await?;
            Ok(None)
        }
    }
}
