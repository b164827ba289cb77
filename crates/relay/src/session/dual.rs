use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::cache::{get_json, session_key, set_json, FastCache};
use crate::metrics;
use crate::store::{DurableStore, SessionRecord, StoreError};

/// Session persistence as seen by the session manager.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &SessionRecord) -> Result<SessionRecord, StoreError>;

    async fn load(&self, user_id: Uuid) -> Result<Option<SessionRecord>, StoreError>;

    async fn refresh(
        &self,
        user_id: Uuid,
        session_id: &str,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, StoreError>;

    async fn remove(&self, user_id: Uuid, session_id: Option<&str>) -> Result<u64, StoreError>;
}

/// Fast tier in front of a durable tier.
///
/// Durable failures propagate. Cache failures are logged, counted and
/// otherwise ignored, so a dead cache only costs latency.
pub struct DualSessionStore {
    durable: Arc<dyn DurableStore>,
    cache: Arc<dyn FastCache>,
    ttl: Duration,
}

impl DualSessionStore {
    pub fn new(durable: Arc<dyn DurableStore>, cache: Arc<dyn FastCache>, ttl: Duration) -> Self {
        Self { durable, cache, ttl }
    }

    async fn write_cache(&self, session: &SessionRecord) {
        let key = session_key(session.user_id);
        if let Err(error) = set_json(self.cache.as_ref(), &key, session, self.ttl).await {
            metrics::record_cache_fallback("session_write");
            warn!(user_id = %session.user_id, error = %error, "session cache write failed");
        }
    }

    async fn evict_cache(&self, user_id: Uuid) {
        if let Err(error) = self.cache.delete(&session_key(user_id)).await {
            metrics::record_cache_fallback("session_evict");
            warn!(user_id = %user_id, error = %error, "session cache eviction failed");
        }
    }
}

#[async_trait]
impl SessionStore for DualSessionStore {
    async fn save(&self, session: &SessionRecord) -> Result<SessionRecord, StoreError> {
        let stored = self.durable.upsert_session(session).await?;
        self.write_cache(&stored).await;
        Ok(stored)
    }

    async fn load(&self, user_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        match get_json::<SessionRecord>(self.cache.as_ref(), &session_key(user_id)).await {
            Ok(Some(session)) => return Ok(Some(session)),
            Ok(None) => {}
            Err(error) => {
                metrics::record_cache_fallback("session_read");
                warn!(user_id = %user_id, error = %error, "session cache read failed, using durable store");
            }
        }

        let session = self.durable.find_session(user_id).await?;
        if let Some(session) = &session {
            self.write_cache(session).await;
        }
        Ok(session)
    }

    async fn refresh(
        &self,
        user_id: Uuid,
        session_id: &str,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let refreshed =
            self.durable.touch_session(user_id, session_id, last_activity, expires_at).await?;
        match &refreshed {
            Some(session) => self.write_cache(session).await,
            None => self.evict_cache(user_id).await,
        }
        Ok(refreshed)
    }

    async fn remove(&self, user_id: Uuid, session_id: Option<&str>) -> Result<u64, StoreError> {
        let removed = self.durable.delete_session(user_id, session_id).await;
        self.evict_cache(user_id).await;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DeadlineCache, MemoryCache};
    use crate::store::{MemoryStore, SessionMetadata};

    fn record(user_id: Uuid, session_id: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            user_id,
            session_id: session_id.to_owned(),
            created_at: now,
            last_activity: now,
            expires_at: now + chrono::Duration::seconds(1800),
            metadata: SessionMetadata::default(),
        }
    }

    fn dual(store: Arc<MemoryStore>, cache: Arc<MemoryCache>) -> DualSessionStore {
        DualSessionStore::new(store, cache, Duration::from_secs(1800))
    }

    #[tokio::test]
    async fn save_writes_through_both_tiers() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let user_id = Uuid::new_v4();

        dual(store.clone(), cache.clone()).save(&record(user_id, "s1")).await.expect("save");

        assert!(store.find_session(user_id).await.expect("find").is_some());
        assert!(cache.contains(&session_key(user_id)));
    }

    #[tokio::test]
    async fn load_self_heals_cache_after_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let user_id = Uuid::new_v4();
        store.upsert_session(&record(user_id, "s1")).await.expect("seed");

        let loaded = dual(store, cache.clone()).load(user_id).await.expect("load");

        assert_eq!(loaded.map(|s| s.session_id), Some("s1".to_owned()));
        assert!(cache.contains(&session_key(user_id)));
    }

    #[tokio::test]
    async fn unavailable_cache_degrades_to_durable_only() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        cache.set_unavailable(true);
        let sessions = dual(store.clone(), cache);
        let user_id = Uuid::new_v4();

        sessions.save(&record(user_id, "s1")).await.expect("save despite cache outage");
        let loaded = sessions.load(user_id).await.expect("load despite cache outage");
        assert_eq!(loaded.map(|s| s.session_id), Some("s1".to_owned()));
        assert_eq!(sessions.remove(user_id, None).await.expect("remove"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_cache_never_hangs_reads() {
        let store = Arc::new(MemoryStore::new());
        let memory = Arc::new(MemoryCache::new());
        memory.set_stalled(true);
        let cache = Arc::new(DeadlineCache::new(memory, Duration::from_millis(50)));
        let sessions = DualSessionStore::new(store.clone(), cache, Duration::from_secs(1800));
        let user_id = Uuid::new_v4();
        store.upsert_session(&record(user_id, "s1")).await.expect("seed");

        let loaded = sessions.load(user_id).await.expect("load should fall back");
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn remove_evicts_cache_even_when_durable_fails() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let sessions = dual(store.clone(), cache.clone());
        let user_id = Uuid::new_v4();
        sessions.save(&record(user_id, "s1")).await.expect("save");

        store.set_unavailable(true);
        sessions.remove(user_id, None).await.expect_err("durable delete should fail");
        assert!(!cache.contains(&session_key(user_id)));
    }

    #[tokio::test]
    async fn refresh_of_superseded_session_evicts_cache() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let sessions = dual(store, cache.clone());
        let user_id = Uuid::new_v4();
        sessions.save(&record(user_id, "new")).await.expect("save");

        let now = Utc::now();
        let refreshed = sessions.refresh(user_id, "old", now, now).await.expect("refresh");
        assert!(refreshed.is_none());
        assert!(!cache.contains(&session_key(user_id)));
    }
}
