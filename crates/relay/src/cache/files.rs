use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use uuid::Uuid;

use crate::store::{DurableStore, StoreError, StoredFile};

struct CachedFile {
    file: StoredFile,
    last_access: Instant,
}

/// Bounded file-metadata cache with expire-after-access semantics.
///
/// Misses are fetched from the durable store in a single batched call.
pub struct FileCache {
    entries: Mutex<LruCache<Uuid, CachedFile>>,
    ttl: Duration,
}

impl FileCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)), ttl }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<Uuid, CachedFile>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    fn lookup_cached(&self, id: Uuid, now: Instant) -> Option<StoredFile> {
        let mut entries = self.entries();
        let expired = match entries.get_mut(&id) {
            Some(entry) if now.duration_since(entry.last_access) <= self.ttl => {
                entry.last_access = now;
                return Some(entry.file.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(&id);
        }
        None
    }

    /// Resolve every distinct id in `ids`, returning an id → file map.
    /// Unknown ids are simply absent from the result.
    pub async fn get_files<I>(
        &self,
        store: &dyn DurableStore,
        ids: I,
    ) -> Result<HashMap<Uuid, StoredFile>, StoreError>
    where
        I: IntoIterator<Item = Uuid>,
    {
        let now = Instant::now();
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();
        let mut seen = HashSet::new();

        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.lookup_cached(id, now) {
                Some(file) => {
                    resolved.insert(id, file);
                }
                None => missing.push(id),
            }
        }

        if missing.is_empty() {
            return Ok(resolved);
        }

        let fetched = store.find_files_by_ids(&missing).await?;
        let mut entries = self.entries();
        for file in fetched {
            entries.put(file.id, CachedFile { file: file.clone(), last_access: now });
            resolved.insert(file.id, file);
        }

        Ok(resolved)
    }
}
