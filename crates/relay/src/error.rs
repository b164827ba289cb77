use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use parley_common::protocol::{error::ErrorKind, ws::ServerEvent};
use serde_json::json;
use uuid::Uuid;

use crate::{cache::CacheError, store::StoreError};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

pub const fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::RoomAccessDenied => StatusCode::FORBIDDEN,
        ErrorKind::SessionExpired => StatusCode::UNAUTHORIZED,
        ErrorKind::InvalidSession => StatusCode::UNAUTHORIZED,
        ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ValidationFailed => StatusCode::BAD_REQUEST,
        ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Domain error carried through the session, room and message services.
///
/// Over HTTP it renders as the `{"error": {...}}` envelope; over the socket it
/// becomes an `ERROR` (or `JOIN_ROOM_ERROR`) event with the same stable kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatError {
    kind: ErrorKind,
    message: String,
}

impl ChatError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.kind, self.message.clone())
    }

    pub fn to_join_error_event(&self) -> ServerEvent {
        ServerEvent::JoinRoomError { kind: self.kind, message: self.message.clone() }
    }
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ChatError {}

impl From<StoreError> for ChatError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Corrupt(message) => {
                tracing::error!(error = %message, "durable store returned an unreadable row");
                Self::from_kind(ErrorKind::InternalError)
            }
            other => {
                tracing::warn!(error = %other, "durable store call failed");
                Self::from_kind(ErrorKind::StoreUnavailable)
            }
        }
    }
}

impl From<CacheError> for ChatError {
    fn from(error: CacheError) -> Self {
        tracing::warn!(error = %error, "fast cache call failed");
        Self::from_kind(ErrorKind::StoreUnavailable)
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();

        let mut response = (
            status_for_kind(self.kind),
            Json(json!({
                "error": {
                    "code": self.kind.as_str(),
                    "message": self.message,
                    "retryable": self.kind.retryable(),
                    "request_id": request_id.clone(),
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
