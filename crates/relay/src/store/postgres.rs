use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::types::MessageKind;
use sqlx::postgres::PgPool;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::{
    DurableStore, Message, MessagePage, NewMessage, NewRoom, Reader, Room, SessionMetadata,
    SessionRecord, StoreError, StoredFile, User,
};

const MESSAGE_COLUMNS: &str =
    "id, room_id, sender_id, content, kind, timestamp, is_deleted, file_id, metadata";

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    user_id: Uuid,
    session_id: String,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    user_agent: Option<String>,
    ip_address: Option<String>,
    device_info: Option<String>,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        Self {
            user_id: row.user_id,
            session_id: row.session_id,
            created_at: row.created_at,
            last_activity: row.last_activity,
            expires_at: row.expires_at,
            metadata: SessionMetadata {
                user_agent: row.user_agent,
                ip_address: row.ip_address,
                device_info: row.device_info,
            },
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RoomRow {
    id: Uuid,
    name: String,
    creator_id: Uuid,
    has_password: bool,
    password_hash: Option<String>,
    created_at: DateTime<Utc>,
    participant_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    room_id: Uuid,
    sender_id: Option<Uuid>,
    content: String,
    kind: String,
    timestamp: DateTime<Utc>,
    is_deleted: bool,
    file_id: Option<Uuid>,
    metadata: serde_json::Value,
}

#[derive(Debug, sqlx::FromRow)]
struct ReaderRow {
    message_id: Uuid,
    user_id: Uuid,
    read_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ReactionRow {
    message_id: Uuid,
    emoji: String,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    profile_image: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct FileRow {
    id: Uuid,
    filename: String,
    original_name: String,
    mime_type: String,
    size: i64,
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Attach readers and reactions to a batch of message rows with two `ANY($1)` queries.
    async fn hydrate(&self, rows: Vec<MessageRow>) -> Result<Vec<Message>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();

        let reader_rows = sqlx::query_as::<_, ReaderRow>(
            r#"
            SELECT message_id, user_id, read_at
            FROM message_readers
            WHERE message_id = ANY($1)
            ORDER BY read_at ASC, user_id ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let reaction_rows = sqlx::query_as::<_, ReactionRow>(
            r#"
            SELECT message_id, emoji, user_id
            FROM message_reactions
            WHERE message_id = ANY($1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut readers: HashMap<Uuid, Vec<Reader>> = HashMap::new();
        for row in reader_rows {
            readers
                .entry(row.message_id)
                .or_default()
                .push(Reader { user_id: row.user_id, read_at: row.read_at });
        }

        let mut reactions: HashMap<Uuid, BTreeMap<String, Vec<Uuid>>> = HashMap::new();
        for row in reaction_rows {
            reactions.entry(row.message_id).or_default().entry(row.emoji).or_default().push(row.user_id);
        }

        rows.into_iter()
            .map(|row| {
                let kind = MessageKind::from_db_value(&row.kind).ok_or_else(|| {
                    StoreError::Corrupt(format!("message {} has unknown kind `{}`", row.id, row.kind))
                })?;
                let metadata = match row.metadata {
                    serde_json::Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                Ok(Message {
                    id: row.id,
                    room_id: row.room_id,
                    sender_id: row.sender_id,
                    content: row.content,
                    kind,
                    timestamp: row.timestamp,
                    is_deleted: row.is_deleted,
                    reactions: reactions.remove(&row.id).unwrap_or_default(),
                    readers: readers.remove(&row.id).unwrap_or_default(),
                    file_id: row.file_id,
                    metadata,
                })
            })
            .collect()
    }
}

#[async_trait]
impl DurableStore for PostgresStore {
    async fn upsert_session(&self, session: &SessionRecord) -> Result<SessionRecord, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO sessions (
                user_id, session_id, created_at, last_activity, expires_at,
                user_agent, ip_address, device_info
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id) DO UPDATE SET
                session_id = EXCLUDED.session_id,
                created_at = EXCLUDED.created_at,
                last_activity = EXCLUDED.last_activity,
                expires_at = EXCLUDED.expires_at,
                user_agent = EXCLUDED.user_agent,
                ip_address = EXCLUDED.ip_address,
                device_info = EXCLUDED.device_info
            RETURNING user_id, session_id, created_at, last_activity, expires_at,
                      user_agent, ip_address, device_info
            "#,
        )
        .bind(session.user_id)
        .bind(&session.session_id)
        .bind(session.created_at)
        .bind(session.last_activity)
        .bind(session.expires_at)
        .bind(&session.metadata.user_agent)
        .bind(&session.metadata.ip_address)
        .bind(&session.metadata.device_info)
        .fetch_one(&self.pool)
        .instrument(info_span!("parley.store.upsert_session", user_id = %session.user_id))
        .await?;

        Ok(row.into())
    }

    async fn find_session(&self, user_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT user_id, session_id, created_at, last_activity, expires_at,
                   user_agent, ip_address, device_info
            FROM sessions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .instrument(info_span!("parley.store.find_session", user_id = %user_id))
        .await?;

        Ok(row.map(Into::into))
    }

    async fn touch_session(
        &self,
        user_id: Uuid,
        session_id: &str,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE sessions
            SET last_activity = $3, expires_at = $4
            WHERE user_id = $1 AND session_id = $2
            RETURNING user_id, session_id, created_at, last_activity, expires_at,
                      user_agent, ip_address, device_info
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .bind(last_activity)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .instrument(info_span!("parley.store.touch_session", user_id = %user_id))
        .await?;

        Ok(row.map(Into::into))
    }

    async fn delete_session(
        &self,
        user_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sessions
            WHERE user_id = $1 AND ($2::TEXT IS NULL OR session_id = $2)
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .execute(&self.pool)
        .instrument(info_span!("parley.store.delete_session", user_id = %user_id))
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        let row = sqlx::query_as::<_, RoomRow>(
            r#"
            SELECT
                r.id, r.name, r.creator_id, r.has_password, r.password_hash, r.created_at,
                COALESCE(
                    array_agg(p.user_id) FILTER (WHERE p.user_id IS NOT NULL),
                    '{}'
                ) AS participant_ids
            FROM rooms r
            LEFT JOIN room_participants p ON p.room_id = r.id
            WHERE r.id = $1
            GROUP BY r.id
            "#,
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .instrument(info_span!("parley.store.find_room", room_id = %room_id))
        .await?;

        Ok(row.map(|row| Room {
            id: row.id,
            name: row.name,
            creator_id: row.creator_id,
            has_password: row.has_password,
            password_hash: row.password_hash,
            participant_ids: row.participant_ids.into_iter().collect::<BTreeSet<_>>(),
            created_at: row.created_at,
        }))
    }

    async fn create_room(&self, room: NewRoom) -> Result<Room, StoreError> {
        let span = info_span!("parley.store.create_room", creator_id = %room.creator_id);
        async {
            let mut tx = self.pool.begin().await?;
            let (id, created_at) = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
                r#"
                INSERT INTO rooms (id, name, creator_id, has_password, password_hash)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, created_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&room.name)
            .bind(room.creator_id)
            .bind(room.password_hash.is_some())
            .bind(room.password_hash.as_deref())
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO room_participants (room_id, user_id) VALUES ($1, $2)")
                .bind(id)
                .bind(room.creator_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            Ok::<_, StoreError>(Room {
                id,
                has_password: room.password_hash.is_some(),
                participant_ids: BTreeSet::from([room.creator_id]),
                name: room.name,
                creator_id: room.creator_id,
                password_hash: room.password_hash,
                created_at,
            })
        }
        .instrument(span)
        .await
    }

    async fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO room_participants (room_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (room_id, user_id) DO NOTHING
            "#,
        )
        .bind(room_id)
        .bind(user_id)
        .execute(&self.pool)
        .instrument(info_span!("parley.store.add_participant", room_id = %room_id, user_id = %user_id))
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn remove_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM room_participants WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(info_span!(
                "parley.store.remove_participant",
                room_id = %room_id,
                user_id = %user_id
            ))
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_messages_page(
        &self,
        room_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<MessagePage, StoreError> {
        let fetch = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);
        let mut rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE room_id = $1 AND NOT is_deleted AND timestamp < $2
            ORDER BY timestamp DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(room_id)
        .bind(before)
        .bind(fetch)
        .fetch_all(&self.pool)
        .instrument(info_span!("parley.store.find_messages_page", room_id = %room_id, limit))
        .await?;

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        Ok(MessagePage { messages: self.hydrate(rows).await?, has_more })
    }

    async fn find_messages_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Message>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .instrument(info_span!("parley.store.find_messages_by_ids", count = ids.len()))
        .await?;

        // Keep the caller's order; the first id decides the owning room.
        let mut by_id: HashMap<Uuid, Message> =
            self.hydrate(rows).await?.into_iter().map(|message| (message.id, message)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let room_id = message.room_id;
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            INSERT INTO messages (id, room_id, sender_id, content, kind, timestamp, file_id, metadata)
            VALUES (
                $1, $2, $3, $4, $5,
                GREATEST(
                    $6::TIMESTAMPTZ,
                    (SELECT MAX(timestamp) + INTERVAL '1 millisecond' FROM messages WHERE room_id = $2)
                ),
                $7, $8
            )
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(message.room_id)
        .bind(message.sender_id)
        .bind(message.content)
        .bind(message.kind.as_str())
        .bind(message.timestamp)
        .bind(message.file_id)
        .bind(serde_json::Value::Object(message.metadata))
        .fetch_one(&self.pool)
        .instrument(info_span!("parley.store.insert_message", room_id = %room_id))
        .await?;

        self.hydrate(vec![row])
            .await?
            .pop()
            .ok_or_else(|| StoreError::Corrupt("inserted message row vanished".into()))
    }

    async fn mark_read(
        &self,
        message_ids: &[Uuid],
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO message_readers (message_id, user_id, read_at)
            SELECT id, $2, $3 FROM messages WHERE id = ANY($1)
            ON CONFLICT (message_id, user_id) DO NOTHING
            "#,
        )
        .bind(message_ids)
        .bind(user_id)
        .bind(read_at)
        .execute(&self.pool)
        .instrument(info_span!(
            "parley.store.mark_read",
            user_id = %user_id,
            count = message_ids.len()
        ))
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_users_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, name, email, profile_image FROM users WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .instrument(info_span!("parley.store.find_users_by_ids", count = ids.len()))
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| User {
                id: row.id,
                name: row.name,
                email: row.email,
                profile_image: row.profile_image,
            })
            .collect())
    }

    async fn find_files_by_ids(&self, ids: &[Uuid]) -> Result<Vec<StoredFile>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT id, filename, original_name, mime_type, size FROM files WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .instrument(info_span!("parley.store.find_files_by_ids", count = ids.len()))
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredFile {
                id: row.id,
                filename: row.filename,
                original_name: row.original_name,
                mime_type: row.mime_type,
                size: row.size,
            })
            .collect())
    }
}
