//! Postgres-backed message store.
//!
//! Single append-only `messages` table; conversations, unread counts, and
//! ordering are all derived at query time. Uses deadpool for connection
//! pooling and plain tokio-postgres statements.

use crate::error::{AppError, AppResult};
use crate::models::conversation::ConversationSummary;
use crate::models::message::Message;
use crate::store::{group_by_counterpart, validate_append, MessageStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id UUID PRIMARY KEY,
    sender_id UUID NOT NULL,
    receiver_id UUID NOT NULL,
    content TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    read BOOLEAN NOT NULL DEFAULT FALSE,
    CHECK (sender_id <> receiver_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_pair
    ON messages (sender_id, receiver_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_receiver_unread
    ON messages (receiver_id, sender_id) WHERE NOT read;
"#;

pub struct PgStore {
    db: Pool,
}

impl PgStore {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }

    /// Build a lazily-connecting pool from a connection string.
    pub fn connect(database_url: &str) -> AppResult<Self> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e| AppError::Config(format!("invalid database url: {e}")))?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let db = Pool::builder(manager)
            .max_size(16)
            .build()
            .map_err(|e| AppError::Config(format!("build pool: {e}")))?;

        Ok(Self { db })
    }

    /// Create the messages table and indexes if missing.
    pub async fn ensure_schema(&self) -> AppResult<()> {
        let client = self
            .db
            .get()
            .await
            .map_err(|e| AppError::Database(format!("get client: {e}")))?;
        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| AppError::Database(format!("ensure schema: {e}")))?;
        Ok(())
    }

    async fn insert(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        created_at: Option<DateTime<Utc>>,
    ) -> AppResult<Message> {
        let content = validate_append(sender_id, receiver_id, content)?;
        let id = Uuid::new_v4();

        let client = self
            .db
            .get()
            .await
            .map_err(|e| AppError::Database(format!("get client: {e}")))?;

        let row = match created_at {
            Some(created_at) => client
                .query_one(
                    r#"INSERT INTO messages (id, sender_id, receiver_id, content, created_at)
                       VALUES ($1, $2, $3, $4, $5)
                       RETURNING id, sender_id, receiver_id, content, created_at, read"#,
                    &[&id, &sender_id, &receiver_id, &content, &created_at],
                )
                .await,
            None => client
                .query_one(
                    r#"INSERT INTO messages (id, sender_id, receiver_id, content)
                       VALUES ($1, $2, $3, $4)
                       RETURNING id, sender_id, receiver_id, content, created_at, read"#,
                    &[&id, &sender_id, &receiver_id, &content],
                )
                .await,
        }
        .map_err(|e| AppError::Database(format!("insert message: {e}")))?;

        Ok(row_to_message(&row))
    }
}

fn row_to_message(row: &Row) -> Message {
    Message {
        id: row.get("id"),
        sender_id: row.get("sender_id"),
        receiver_id: row.get("receiver_id"),
        content: row.get("content"),
        created_at: row.get("created_at"),
        read: row.get("read"),
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn append(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
    ) -> AppResult<Message> {
        self.insert(sender_id, receiver_id, content, None).await
    }

    async fn append_at(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> AppResult<Message> {
        self.insert(sender_id, receiver_id, content, Some(created_at))
            .await
    }

    async fn list_between(&self, user_a: Uuid, user_b: Uuid) -> AppResult<Vec<Message>> {
        let client = self
            .db
            .get()
            .await
            .map_err(|e| AppError::Database(format!("get client: {e}")))?;

        let rows = client
            .query(
                r#"SELECT id, sender_id, receiver_id, content, created_at, read
                   FROM messages
                   WHERE (sender_id = $1 AND receiver_id = $2)
                      OR (sender_id = $2 AND receiver_id = $1)
                   ORDER BY created_at ASC, id ASC"#,
                &[&user_a, &user_b],
            )
            .await
            .map_err(|e| AppError::Database(format!("list between: {e}")))?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn list_recent_between(
        &self,
        user_a: Uuid,
        user_b: Uuid,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let client = self
            .db
            .get()
            .await
            .map_err(|e| AppError::Database(format!("get client: {e}")))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client
            .query(
                r#"SELECT id, sender_id, receiver_id, content, created_at, read
                   FROM messages
                   WHERE (sender_id = $1 AND receiver_id = $2)
                      OR (sender_id = $2 AND receiver_id = $1)
                   ORDER BY created_at DESC, id DESC
                   LIMIT $3"#,
                &[&user_a, &user_b, &limit],
            )
            .await
            .map_err(|e| AppError::Database(format!("list recent: {e}")))?;

        let mut messages: Vec<Message> = rows.iter().map(row_to_message).collect();
        messages.reverse();
        Ok(messages)
    }

    async fn list_conversations_for(&self, user_id: Uuid) -> AppResult<Vec<ConversationSummary>> {
        let client = self
            .db
            .get()
            .await
            .map_err(|e| AppError::Database(format!("get client: {e}")))?;

        let rows = client
            .query(
                r#"SELECT id, sender_id, receiver_id, content, created_at, read
                   FROM messages
                   WHERE sender_id = $1 OR receiver_id = $1
                   ORDER BY created_at ASC, id ASC"#,
                &[&user_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("list conversations: {e}")))?;

        let involving: Vec<Message> = rows.iter().map(row_to_message).collect();
        Ok(group_by_counterpart(user_id, &involving))
    }

    async fn mark_read(&self, receiver_id: Uuid, sender_id: Uuid) -> AppResult<u64> {
        let client = self
            .db
            .get()
            .await
            .map_err(|e| AppError::Database(format!("get client: {e}")))?;

        let transitions = client
            .execute(
                "UPDATE messages SET read = TRUE \
                 WHERE receiver_id = $1 AND sender_id = $2 AND NOT read",
                &[&receiver_id, &sender_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("mark read: {e}")))?;

        Ok(transitions)
    }

    async fn delete_between(&self, user_a: Uuid, user_b: Uuid) -> AppResult<()> {
        let client = self
            .db
            .get()
            .await
            .map_err(|e| AppError::Database(format!("get client: {e}")))?;

        // Single statement so both directions go atomically.
        client
            .execute(
                "DELETE FROM messages \
                 WHERE (sender_id = $1 AND receiver_id = $2) \
                    OR (sender_id = $2 AND receiver_id = $1)",
                &[&user_a, &user_b],
            )
            .await
            .map_err(|e| AppError::Database(format!("delete between: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_rejects_malformed_url() {
        let result = PgStore::connect("not a connection string");
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn connect_is_lazy() {
        // Building the pool must not require a reachable server.
        assert!(PgStore::connect("host=localhost user=chat dbname=chat_sync").is_ok());
    }
}
