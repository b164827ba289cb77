// Stable error kinds surfaced to realtime clients.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Unauthorized,
    NotFound,
    RoomAccessDenied,
    SessionExpired,
    InvalidSession,
    StoreUnavailable,
    ValidationFailed,
    InternalError,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::RoomAccessDenied => "ROOM_ACCESS_DENIED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::InvalidSession => "INVALID_SESSION",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::StoreUnavailable | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::Unauthorized => "authentication required",
            Self::NotFound => "requested resource not found",
            Self::RoomAccessDenied => "caller is not a participant of this room",
            Self::SessionExpired => "session expired",
            Self::InvalidSession => "invalid session",
            Self::StoreUnavailable => "storage is temporarily unavailable",
            Self::ValidationFailed => "request validation failed",
            Self::InternalError => "internal server error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorKind;

    #[test]
    fn serialized_kind_matches_as_str() {
        for kind in [
            ErrorKind::Unauthorized,
            ErrorKind::NotFound,
            ErrorKind::RoomAccessDenied,
            ErrorKind::SessionExpired,
            ErrorKind::InvalidSession,
            ErrorKind::StoreUnavailable,
            ErrorKind::ValidationFailed,
            ErrorKind::InternalError,
        ] {
            let encoded = serde_json::to_value(kind).expect("kind should serialize");
            assert_eq!(encoded, kind.as_str());
        }
    }

    #[test]
    fn only_infrastructure_failures_are_retryable() {
        assert!(ErrorKind::StoreUnavailable.retryable());
        assert!(!ErrorKind::RoomAccessDenied.retryable());
        assert!(!ErrorKind::SessionExpired.retryable());
    }
}
