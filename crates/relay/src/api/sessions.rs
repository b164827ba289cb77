use axum::{
    extract::{Extension, Json, Query, State},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    middleware,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    auth::middleware::{require_bearer_auth, AuthenticatedUser},
    error::ChatError,
    state::AppState,
    store::SessionMetadata,
};

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const DEVICE_INFO_HEADER: &str = "x-device-info";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSessionQuery {
    pub session_id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let auth_layer = middleware::from_fn_with_state(state.jwt.clone(), require_bearer_auth);

    Router::new()
        .route("/v1/sessions", post(create_session).delete(delete_session))
        .with_state(state)
        .route_layer(auth_layer)
}

/// Login hook: makes a fresh session the caller's only one.
async fn create_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ChatError> {
    let created = state.sessions.create_session(user.user_id, metadata_from_headers(&headers)).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: created.session.session_id,
            expires_in: created.expires_in,
        }),
    ))
}

async fn delete_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<DeleteSessionQuery>,
) -> Result<StatusCode, ChatError> {
    let session_id = query.session_id.as_deref().map(str::trim).filter(|value| !value.is_empty());
    state.sessions.remove_session(user.user_id, session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn metadata_from_headers(headers: &HeaderMap) -> SessionMetadata {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
    };

    SessionMetadata {
        user_agent: header(USER_AGENT.as_str()),
        ip_address: header(FORWARDED_FOR_HEADER)
            .and_then(|value| value.split(',').next().map(|first| first.trim().to_owned())),
        device_info: header(DEVICE_INFO_HEADER),
    }
}
