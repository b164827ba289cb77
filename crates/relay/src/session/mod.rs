// Session lifecycle: one authoritative login per user with a sliding TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_common::protocol::error::ErrorKind;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::ChatError;
use crate::store::{SessionMetadata, SessionRecord};

pub mod dual;

pub use dual::{DualSessionStore, SessionStore};

/// A freshly issued session together with its lifetime in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    pub session: SessionRecord,
    pub expires_in: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionValidation {
    Valid(SessionRecord),
    Invalid { kind: ErrorKind, message: String },
}

impl SessionValidation {
    fn invalid(kind: ErrorKind, message: &str) -> Self {
        Self::Invalid { kind, message: message.to_owned() }
    }

    pub fn into_result(self) -> Result<SessionRecord, ChatError> {
        match self {
            Self::Valid(session) => Ok(session),
            Self::Invalid { kind, message } => Err(ChatError::new(kind, message)),
        }
    }
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
    debounce: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration, debounce: Duration) -> Self {
        Self { store, ttl, debounce }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn ttl_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX)
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.ttl_delta()).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub async fn create_session(
        &self,
        user_id: Uuid,
        metadata: SessionMetadata,
    ) -> Result<SessionData, ChatError> {
        self.create_session_at(user_id, metadata, Utc::now()).await
    }

    /// Issue a new session id and make it the only session of `user_id`.
    pub async fn create_session_at(
        &self,
        user_id: Uuid,
        metadata: SessionMetadata,
        now: DateTime<Utc>,
    ) -> Result<SessionData, ChatError> {
        let session = SessionRecord {
            user_id,
            session_id: Uuid::new_v4().simple().to_string(),
            created_at: now,
            last_activity: now,
            expires_at: self.expiry_from(now),
            metadata,
        };

        let stored = self
            .store
            .save(&session)
            .instrument(info_span!("parley.session.create", user_id = %user_id))
            .await?;
        info!(user_id = %user_id, "session created");

        Ok(SessionData { session: stored, expires_in: self.ttl.as_secs() })
    }

    pub async fn validate_session(
        &self,
        user_id: Uuid,
        session_id: &str,
    ) -> Result<SessionValidation, ChatError> {
        self.validate_session_at(user_id, session_id, Utc::now()).await
    }

    pub async fn validate_session_at(
        &self,
        user_id: Uuid,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionValidation, ChatError> {
        if user_id.is_nil() || session_id.trim().is_empty() {
            return Ok(SessionValidation::invalid(ErrorKind::InvalidSession, "session credentials are missing"));
        }

        let Some(session) = self
            .store
            .load(user_id)
            .instrument(info_span!("parley.session.validate", user_id = %user_id))
            .await?
        else {
            return Ok(SessionValidation::invalid(ErrorKind::InvalidSession, "session not found"));
        };

        if session.session_id != session_id {
            return Ok(SessionValidation::invalid(
                ErrorKind::InvalidSession,
                "session was replaced by a newer login",
            ));
        }

        if now - session.last_activity > self.ttl_delta() {
            if let Err(error) = self.store.remove(user_id, Some(session_id)).await {
                warn!(user_id = %user_id, error = %error, "failed to remove expired session");
            }
            return Ok(SessionValidation::invalid(ErrorKind::SessionExpired, "session expired"));
        }

        Ok(SessionValidation::Valid(session))
    }

    pub async fn update_last_activity(&self, user_id: Uuid) -> bool {
        self.update_last_activity_at(user_id, Utc::now()).await
    }

    /// Slide the session window forward. Returns `true` when a refresh was written.
    ///
    /// Refreshes closer together than the debounce interval are skipped, and
    /// failures are only logged.
    pub async fn update_last_activity_at(&self, user_id: Uuid, now: DateTime<Utc>) -> bool {
        let session = match self.store.load(user_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return false,
            Err(error) => {
                warn!(user_id = %user_id, error = %error, "could not load session for activity refresh");
                return false;
            }
        };

        let debounce = chrono::Duration::from_std(self.debounce).unwrap_or(chrono::Duration::MAX);
        if now - session.last_activity < debounce {
            return false;
        }

        match self.store.refresh(user_id, &session.session_id, now, self.expiry_from(now)).await {
            Ok(refreshed) => refreshed.is_some(),
            Err(error) => {
                warn!(user_id = %user_id, error = %error, "session activity refresh failed");
                false
            }
        }
    }

    /// Delete the user's session (or only `session_id`), always evicting the cache.
    pub async fn remove_session(
        &self,
        user_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<(), ChatError> {
        let removed = self
            .store
            .remove(user_id, session_id)
            .instrument(info_span!("parley.session.remove", user_id = %user_id))
            .await?;
        info!(user_id = %user_id, removed, "session removed");
        Ok(())
    }

    pub async fn active_session(&self, user_id: Uuid) -> Result<Option<SessionRecord>, ChatError> {
        Ok(self.store.load(user_id).await?)
    }
}
