// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own `PARLEY_DB_*` knobs.

use std::net::SocketAddr;
use std::time::Duration;

const DEV_JWT_SECRET: &str = "parley_local_development_jwt_secret_must_be_32_chars";

/// Core relay server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret used to verify access tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Redis connection string. `None` selects the in-memory cache.
    pub redis_url: Option<String>,
    /// Log filter directive (e.g. `info`, `parley_relay=debug`).
    pub log_filter: String,
    /// Sliding session lifetime measured from the last recorded activity.
    pub session_ttl: Duration,
    /// Minimum gap between two activity refreshes of the same session.
    pub activity_debounce: Duration,
    /// Upper bound for any single durable store call.
    pub store_timeout: Duration,
    /// Upper bound for any single fast cache call.
    pub cache_timeout: Duration,
    /// Default message page size for joins and history fetches.
    pub page_size: u32,
    pub file_cache_capacity: usize,
    pub file_cache_ttl: Duration,
    /// Run read-receipt persistence and broadcast on a spawned task.
    pub read_receipts_deferred: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PARLEY_HOST` | `0.0.0.0` |
    /// | `PARLEY_PORT` | `8080` |
    /// | `PARLEY_JWT_SECRET` | dev-only placeholder |
    /// | `PARLEY_DATABASE_URL` | *(none: in-memory store)* |
    /// | `PARLEY_REDIS_URL` | *(none: in-memory cache)* |
    /// | `PARLEY_LOG_FILTER` | `info` |
    /// | `PARLEY_SESSION_TTL_SECS` | `1800` |
    /// | `PARLEY_ACTIVITY_DEBOUNCE_SECS` | `30` |
    /// | `PARLEY_STORE_TIMEOUT_MS` | `5000` |
    /// | `PARLEY_CACHE_TIMEOUT_MS` | `500` |
    /// | `PARLEY_PAGE_SIZE` | `30` |
    /// | `PARLEY_FILE_CACHE_CAPACITY` | `10000` |
    /// | `PARLEY_FILE_CACHE_TTL_SECS` | `600` |
    /// | `PARLEY_READ_RECEIPTS_DEFERRED` | `false` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parsed = |key: &str| env(key).ok().and_then(|value| value.trim().parse::<u64>().ok());

        let host = env("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("PARLEY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("PARLEY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("PARLEY_DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let redis_url = env("PARLEY_REDIS_URL").ok().filter(|v| !v.trim().is_empty());
        let log_filter = env("PARLEY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let page_size = parsed("PARLEY_PAGE_SIZE")
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(30);
        let file_cache_capacity = parsed("PARLEY_FILE_CACHE_CAPACITY")
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(10_000);

        let read_receipts_deferred = env("PARLEY_READ_RECEIPTS_DEFERRED")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            redis_url,
            log_filter,
            session_ttl: Duration::from_secs(parsed("PARLEY_SESSION_TTL_SECS").unwrap_or(1800)),
            activity_debounce: Duration::from_secs(
                parsed("PARLEY_ACTIVITY_DEBOUNCE_SECS").unwrap_or(30),
            ),
            store_timeout: Duration::from_millis(parsed("PARLEY_STORE_TIMEOUT_MS").unwrap_or(5000)),
            cache_timeout: Duration::from_millis(parsed("PARLEY_CACHE_TIMEOUT_MS").unwrap_or(500)),
            page_size,
            file_cache_capacity,
            file_cache_ttl: Duration::from_secs(parsed("PARLEY_FILE_CACHE_TTL_SECS").unwrap_or(600)),
            read_receipts_deferred,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.session_ttl, Duration::from_secs(1800));
        assert_eq!(cfg.activity_debounce, Duration::from_secs(30));
        assert_eq!(cfg.store_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.cache_timeout, Duration::from_millis(500));
        assert_eq!(cfg.page_size, 30);
        assert_eq!(cfg.file_cache_capacity, 10_000);
        assert_eq!(cfg.file_cache_ttl, Duration::from_secs(600));
        assert!(!cfg.read_receipts_deferred);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("PARLEY_HOST", "127.0.0.1");
        m.insert("PARLEY_PORT", "3000");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("PARLEY_PORT", "not_a_number");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("PARLEY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn backend_urls_from_env() {
        let mut m = HashMap::new();
        m.insert("PARLEY_DATABASE_URL", "postgres://u:p@host/db?sslmode=require");
        m.insert("PARLEY_REDIS_URL", "redis://cache:6379");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://u:p@host/db?sslmode=require"));
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn blank_backend_urls_fall_back_to_memory() {
        let mut m = HashMap::new();
        m.insert("PARLEY_DATABASE_URL", "  ");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn session_and_timeout_overrides() {
        let mut m = HashMap::new();
        m.insert("PARLEY_SESSION_TTL_SECS", "60");
        m.insert("PARLEY_ACTIVITY_DEBOUNCE_SECS", "5");
        m.insert("PARLEY_STORE_TIMEOUT_MS", "250");
        m.insert("PARLEY_CACHE_TIMEOUT_MS", "20");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.session_ttl, Duration::from_secs(60));
        assert_eq!(cfg.activity_debounce, Duration::from_secs(5));
        assert_eq!(cfg.store_timeout, Duration::from_millis(250));
        assert_eq!(cfg.cache_timeout, Duration::from_millis(20));
    }

    #[test]
    fn zero_page_size_uses_default() {
        let mut m = HashMap::new();
        m.insert("PARLEY_PAGE_SIZE", "0");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.page_size, 30);
    }

    #[test]
    fn read_receipt_dispatch_flag_accepts_truthy_values() {
        for value in ["1", "true", "TRUE", "on"] {
            let mut m = HashMap::new();
            m.insert("PARLEY_READ_RECEIPTS_DEFERRED", value);
            assert!(ServerConfig::from_env_fn(env_from_map(m)).read_receipts_deferred);
        }

        let mut m = HashMap::new();
        m.insert("PARLEY_READ_RECEIPTS_DEFERRED", "no");
        assert!(!ServerConfig::from_env_fn(env_from_map(m)).read_receipts_deferred);
    }
}
