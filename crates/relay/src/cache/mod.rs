// Fast cache adapter: TTL key-value storage with an explicit failure signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod files;
pub mod memory;
pub mod redis_store;

pub use files::FileCache;
pub use memory::MemoryCache;
pub use redis_store::RedisCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache call `{operation}` timed out")]
    Timeout { operation: &'static str },

    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cached value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A shared key-value cache. Callers treat every error as "cache absent".
#[async_trait]
pub trait FastCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

pub fn session_key(user_id: Uuid) -> String {
    format!("session:{user_id}")
}

pub fn room_key(room_id: Uuid) -> String {
    format!("room:{room_id}")
}

pub async fn get_json<T>(cache: &dyn FastCache, key: &str) -> Result<Option<T>, CacheError>
where
    T: DeserializeOwned,
{
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T>(
    cache: &dyn FastCache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError>
where
    T: Serialize + ?Sized,
{
    cache.set(key, serde_json::to_string(value)?, ttl).await
}

async fn within<T, F>(timeout: Duration, operation: &'static str, future: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout { operation }),
    }
}

/// Bounds every cache call so a stalled backend degrades instead of hanging.
pub struct DeadlineCache {
    inner: Arc<dyn FastCache>,
    timeout: Duration,
}

impl DeadlineCache {
    pub fn new(inner: Arc<dyn FastCache>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl FastCache for DeadlineCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        within(self.timeout, "get", self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        within(self.timeout, "set", self.inner.set(key, value, ttl)).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        within(self.timeout, "delete", self.inner.delete(key)).await
    }
}
