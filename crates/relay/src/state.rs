use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::auth::jwt::JwtAccessTokenService;
use crate::broadcast::LocalBroadcast;
use crate::cache::{DeadlineCache, FastCache, FileCache, MemoryCache, RedisCache};
use crate::config::ServerConfig;
use crate::db::{
    migrations::run_migrations,
    pool::{create_pg_pool, PoolConfig},
};
use crate::messages::{MessageLoader, MessageService, ReadReceiptService, ReceiptDispatch};
use crate::metrics::{self, ChatMetrics};
use crate::rooms::{JoinHandler, MembershipCache, RoomDirectory};
use crate::session::{DualSessionStore, SessionManager};
use crate::store::{DeadlineStore, DurableStore, MemoryStore, PostgresStore};

/// Everything a request or socket task needs, shared behind `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub jwt: Arc<JwtAccessTokenService>,
    pub store: Arc<dyn DurableStore>,
    pub sessions: Arc<SessionManager>,
    pub hub: Arc<LocalBroadcast>,
    pub membership: Arc<MembershipCache>,
    pub rooms: Arc<RoomDirectory>,
    pub joins: Arc<JoinHandler>,
    pub messages: Arc<MessageService>,
    pub receipts: Arc<ReadReceiptService>,
    pub metrics: Arc<ChatMetrics>,
}

impl AppState {
    /// Wire the services over the given backends. Both backends are wrapped
    /// in the configured call deadlines.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn FastCache>,
    ) -> anyhow::Result<Self> {
        let jwt = Arc::new(
            JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?,
        );
        let store: Arc<dyn DurableStore> = Arc::new(DeadlineStore::new(store, config.store_timeout));
        let cache: Arc<dyn FastCache> = Arc::new(DeadlineCache::new(cache, config.cache_timeout));

        let sessions = Arc::new(SessionManager::new(
            Arc::new(DualSessionStore::new(Arc::clone(&store), Arc::clone(&cache), config.session_ttl)),
            config.session_ttl,
            config.activity_debounce,
        ));

        let hub = Arc::new(LocalBroadcast::new());
        let membership = Arc::new(MembershipCache::new());
        let rooms = Arc::new(RoomDirectory::new(Arc::clone(&store), cache));
        let files = Arc::new(FileCache::new(config.file_cache_capacity, config.file_cache_ttl));
        let loader = Arc::new(MessageLoader::new(Arc::clone(&store), Arc::clone(&files), config.page_size));

        let joins = Arc::new(JoinHandler::new(
            Arc::clone(&store),
            Arc::clone(&rooms),
            Arc::clone(&membership),
            hub.clone(),
            Arc::clone(&loader),
        ));
        let messages = Arc::new(MessageService::new(
            Arc::clone(&store),
            files,
            Arc::clone(&rooms),
            Arc::clone(&membership),
            hub.clone(),
            loader,
        ));
        let dispatch = if config.read_receipts_deferred {
            ReceiptDispatch::Deferred
        } else {
            ReceiptDispatch::Inline
        };
        let receipts = Arc::new(ReadReceiptService::new(
            Arc::clone(&store),
            Arc::clone(&rooms),
            Arc::clone(&membership),
            hub.clone(),
            dispatch,
        ));

        let metrics = Arc::new(ChatMetrics::default());
        metrics::set_global_metrics(Arc::clone(&metrics));

        Ok(Self {
            config: Arc::new(config),
            jwt,
            store,
            sessions,
            hub,
            membership,
            rooms,
            joins,
            messages,
            receipts,
            metrics,
        })
    }

    /// Connect the configured backends, falling back to in-memory ones when
    /// no URL is set. Postgres migrations run before the state is returned.
    pub async fn connect(config: ServerConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn DurableStore> = match config.database_url.as_deref() {
            Some(database_url) => {
                let pool = create_pg_pool(database_url, PoolConfig::from_env())
                    .await
                    .context("failed to connect to postgres")?;
                run_migrations(&pool).await.context("failed to run relay migrations")?;
                info!("using postgres durable store");
                Arc::new(PostgresStore::new(pool))
            }
            None => {
                warn!("PARLEY_DATABASE_URL not set, using in-memory durable store");
                Arc::new(MemoryStore::new())
            }
        };

        let cache: Arc<dyn FastCache> = match config.redis_url.as_deref() {
            Some(redis_url) => {
                let redis = RedisCache::connect(redis_url).await.context("failed to connect to redis")?;
                redis.ping().await.context("redis did not answer PING")?;
                info!("using redis fast cache");
                Arc::new(redis)
            }
            None => {
                warn!("PARLEY_REDIS_URL not set, using in-memory fast cache");
                Arc::new(MemoryCache::new())
            }
        };

        Self::new(config, store, cache)
    }
}
