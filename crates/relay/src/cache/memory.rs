use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheError, FastCache};

/// Expiry used when `now + ttl` is not representable.
const MAX_ENTRY_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Process-local cache with per-entry expiry, used when no Redis URL is configured.
///
/// `set_unavailable` and `set_stalled` let tests exercise the degraded paths.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    unavailable: AtomicBool,
    stalled: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every call hang until the caller's deadline fires.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().get(key).is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expiry(ttl: Duration) -> Instant {
        let now = Instant::now();
        now.checked_add(ttl).unwrap_or_else(|| now + MAX_ENTRY_TTL)
    }

    async fn gate(&self) -> Result<(), CacheError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory cache switched offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.gate().await?;
        let mut entries = self.entries();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.gate().await?;
        self.entries().insert(key.to_owned(), (value, Self::expiry(ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.gate().await?;
        self.entries().remove(key);
        Ok(())
    }
}
