use chrono::Utc;
use parley_relay::db::{
    migrations::run_migrations,
    pool::{check_pool_health, create_pg_pool, PoolConfig},
};
use parley_relay::store::{
    DurableStore, NewMessage, NewRoom, PostgresStore, SessionMetadata, SessionRecord,
};
use sqlx::PgPool;
use uuid::Uuid;

const EXPECTED_TABLES: &[&str] = &[
    "users",
    "files",
    "sessions",
    "rooms",
    "room_participants",
    "messages",
    "message_readers",
    "message_reactions",
];

async fn test_pool() -> Option<PgPool> {
    let Some(database_url) = std::env::var("PARLEY_TEST_DATABASE_URL").ok() else {
        eprintln!("skipping db integration test: set PARLEY_TEST_DATABASE_URL");
        return None;
    };

    let config = PoolConfig { min_connections: 1, max_connections: 4, ..PoolConfig::default() };
    let pool =
        create_pg_pool(&database_url, config).await.expect("pool should connect to test database");
    run_migrations(&pool).await.expect("migrations should apply");
    Some(pool)
}

async fn seed_user(pool: &PgPool, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, name, email) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(name)
        .bind(format!("{}-{}@example.test", name.to_lowercase(), id.simple()))
        .execute(pool)
        .await
        .expect("user should insert");
    id
}

async fn seed_room(pool: &PgPool, creator_id: Uuid) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO rooms (id, name, creator_id) VALUES ($1, $2, $3)")
        .bind(id)
        .bind("integration")
        .bind(creator_id)
        .execute(pool)
        .await
        .expect("room should insert");
    sqlx::query("INSERT INTO room_participants (room_id, user_id) VALUES ($1, $2)")
        .bind(id)
        .bind(creator_id)
        .execute(pool)
        .await
        .expect("creator should join");
    id
}

#[tokio::test]
async fn migrations_create_expected_tables() {
    let Some(pool) = test_pool().await else {
        return;
    };
    check_pool_health(&pool).await.expect("health check query should succeed");

    let table_names: Vec<String> = sqlx::query_scalar::<_, String>(
        "SELECT table_name \
         FROM information_schema.tables \
         WHERE table_schema = 'public'",
    )
    .fetch_all(&pool)
    .await
    .expect("table lookup should succeed");

    for expected_table in EXPECTED_TABLES {
        assert!(
            table_names.iter().any(|name| name == expected_table),
            "expected table `{expected_table}` to exist after migrations"
        );
    }
}

#[tokio::test]
async fn session_upsert_keeps_one_row_per_user() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PostgresStore::new(pool.clone());
    let user_id = seed_user(&pool, "Ana").await;
    let now = Utc::now();

    for session_id in ["first", "second"] {
        store
            .upsert_session(&SessionRecord {
                user_id,
                session_id: session_id.to_owned(),
                created_at: now,
                last_activity: now,
                expires_at: now + chrono::Duration::minutes(30),
                metadata: SessionMetadata::default(),
            })
            .await
            .expect("upsert");
    }

    let stored = store.find_session(user_id).await.expect("find").expect("session exists");
    assert_eq!(stored.session_id, "second");
    assert!(store.touch_session(user_id, "first", now, now).await.expect("touch").is_none());
}

#[tokio::test]
async fn created_room_lists_its_creator_as_participant() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PostgresStore::new(pool.clone());
    let creator = seed_user(&pool, "Creator").await;

    let created = store
        .create_room(NewRoom {
            name: "launch".into(),
            creator_id: creator,
            password_hash: Some("$argon2id$hash".into()),
        })
        .await
        .expect("create");
    assert!(created.has_password);

    let found = store.find_room(created.id).await.expect("find").expect("room exists");
    assert_eq!(found.name, "launch");
    assert_eq!(found.creator_id, creator);
    assert_eq!(found.password_hash.as_deref(), Some("$argon2id$hash"));
    assert_eq!(found.participant_ids.into_iter().collect::<Vec<_>>(), vec![creator]);

    let orphan = store
        .create_room(NewRoom { name: "orphan".into(), creator_id: Uuid::new_v4(), password_hash: None })
        .await;
    assert!(orphan.is_err(), "unknown creator must be rejected");
}

#[tokio::test]
async fn concurrent_participant_adds_converge() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = std::sync::Arc::new(PostgresStore::new(pool.clone()));
    let creator = seed_user(&pool, "Owner").await;
    let room_id = seed_room(&pool, creator).await;

    let mut guests = Vec::new();
    for index in 0..8 {
        guests.push(seed_user(&pool, &format!("Guest{index}")).await);
    }

    let tasks: Vec<_> = guests
        .iter()
        .flat_map(|guest| [*guest, *guest])
        .map(|guest| {
            let store = store.clone();
            tokio::spawn(async move { store.add_participant(room_id, guest).await })
        })
        .collect();

    let mut inserted = 0;
    for task in tasks {
        if task.await.expect("task").expect("add") {
            inserted += 1;
        }
    }

    assert_eq!(inserted, guests.len());
    let room = store.find_room(room_id).await.expect("find").expect("room exists");
    assert_eq!(room.participant_ids.len(), guests.len() + 1);
}

#[tokio::test]
async fn readers_are_appended_once() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PostgresStore::new(pool.clone());
    let user_id = seed_user(&pool, "Reader").await;
    let room_id = seed_room(&pool, user_id).await;
    let message = store
        .insert_message(NewMessage::system(room_id, "Reader joined", Utc::now()))
        .await
        .expect("insert");

    store.mark_read(&[message.id], user_id, Utc::now()).await.expect("first mark");
    store.mark_read(&[message.id], user_id, Utc::now()).await.expect("second mark");

    let reloaded = store.find_messages_by_ids(&[message.id]).await.expect("reload");
    assert_eq!(reloaded[0].readers.len(), 1);
}
