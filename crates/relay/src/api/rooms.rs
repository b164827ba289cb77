use axum::{
    extract::{Extension, Json, State},
    http::StatusCode,
    middleware,
    routing::post,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::middleware::{require_bearer_auth, AuthenticatedUser},
    error::ChatError,
    state::AppState,
    store::Room,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomResponse {
    pub id: Uuid,
    pub name: String,
    pub creator_id: Uuid,
    pub has_password: bool,
    pub participant_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<Room> for RoomResponse {
    fn from(room: Room) -> Self {
        Self {
            id: room.id,
            name: room.name,
            creator_id: room.creator_id,
            has_password: room.has_password,
            participant_ids: room.participant_ids.into_iter().collect(),
            created_at: room.created_at,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let auth_layer = middleware::from_fn_with_state(state.jwt.clone(), require_bearer_auth);

    Router::new()
        .route("/v1/rooms", post(create_room))
        .with_state(state)
        .route_layer(auth_layer)
}

async fn create_room(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), ChatError> {
    let room = state.rooms.create_room(user.user_id, &request.name, None).await?;
    Ok((StatusCode::CREATED, Json(room.into())))
}
