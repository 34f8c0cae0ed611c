//! SQLite persistence for conversations and messages

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tracing::debug;
use uuid::Uuid;

use super::{
    errors::{StoreError, StoreResult},
    models::{Conversation, Failure, FailureKind, Message, MessageStatus, NewMessage},
};

/// How long a connection waits on a locked database before giving up
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Upper bound on open connections per database
const MAX_CONNECTIONS: u32 = 4;

/// How long a call waits for a free connection
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(10);

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, role, content, status, \
     failure_kind, failure_detail, reply_to, created_at, updated_at";

/// Durable store for conversations and messages.
///
/// Cloning is cheap and every clone shares the same connection pool. Each call
/// runs on the blocking thread pool with its own pooled connection, and each
/// write is a single transaction, so readers see either the old or the new row.
#[derive(Clone)]
pub struct Database {
    path: Arc<PathBuf>,
    pool: Pool<SqliteConnectionManager>,
}

/// Applied to every connection the pool opens
fn configure_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    Ok(())
}

fn build_pool(path: &Path) -> StoreResult<Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(path).with_init(configure_connection);
    let pool = Pool::builder()
        .max_size(MAX_CONNECTIONS)
        .min_idle(Some(1))
        .connection_timeout(CHECKOUT_TIMEOUT)
        .build(manager)?;
    Ok(pool)
}

fn create_tables(conn: &mut Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            status TEXT NOT NULL,
            failure_kind TEXT,
            failure_detail TEXT,
            reply_to TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations (id) ON DELETE CASCADE,
            UNIQUE (conversation_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id, seq);
        CREATE INDEX IF NOT EXISTS idx_messages_status ON messages (status);
        CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations (updated_at);",
    )?;
    Ok(())
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(index: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_column<T>(index: usize, value: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    value.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e.into())
    })
}

fn conversation_from_row(row: &Row) -> rusqlite::Result<Conversation> {
    let created_at: String = row.get(2)?;
    let updated_at: String = row.get(3)?;
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: parse_timestamp(2, &created_at)?,
        updated_at: parse_timestamp(3, &updated_at)?,
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let role: String = row.get(3)?;
    let status: String = row.get(5)?;
    let failure_kind: Option<String> = row.get(6)?;
    let failure_detail: Option<String> = row.get(7)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    let failure = match failure_kind {
        Some(kind) => Some(Failure {
            kind: parse_column::<FailureKind>(6, &kind)?,
            detail: failure_detail,
        }),
        None => None,
    };

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        role: parse_column(3, &role)?,
        content: row.get(4)?,
        status: parse_column(5, &status)?,
        failure,
        reply_to: row.get(8)?,
        created_at: parse_timestamp(9, &created_at)?,
        updated_at: parse_timestamp(10, &updated_at)?,
    })
}

/// Bump `updated_at`, never moving it backwards
fn touch_conversation(conn: &Connection, conversation_id: &str, now: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = MAX(updated_at, ?1) WHERE id = ?2",
        params![now, conversation_id],
    )?;
    Ok(())
}

fn message_conversation(conn: &Connection, message_id: &str) -> StoreResult<String> {
    conn.query_row(
        "SELECT conversation_id FROM messages WHERE id = ?1",
        [message_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::message_not_found(message_id))
}

impl Database {
    /// Open (or create) the database file and make sure the schema exists
    pub async fn open<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || build_pool(&path)).await??
        };
        let db = Self {
            path: Arc::new(path),
            pool,
        };
        db.with_conn(create_tables).await?;
        debug!(
            "Database ready at {} (max {} connections)",
            db.path.display(),
            MAX_CONNECTIONS
        );

        Ok(db)
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }

    /// Create a new conversation
    pub async fn create_conversation(&self, title: &str) -> StoreResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };

        let row = conversation.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row.id, row.title, timestamp(row.created_at), timestamp(row.updated_at)],
            )?;
            Ok(())
        })
        .await?;

        debug!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    /// Get a conversation by ID
    pub async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let conversation = conn
                .query_row(
                    "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
                    [&id],
                    conversation_from_row,
                )
                .optional()?;
            Ok(conversation)
        })
        .await
    }

    /// List conversations, most recently updated first
    pub async fn list_conversations(&self, limit: Option<u32>) -> StoreResult<Vec<Conversation>> {
        // SQLite treats a negative LIMIT as "no limit"
        let limit = limit.map(i64::from).unwrap_or(-1);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, created_at, updated_at FROM conversations
                 ORDER BY updated_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], conversation_from_row)?;
            let mut conversations = Vec::new();
            for row in rows {
                conversations.push(row?);
            }
            Ok(conversations)
        })
        .await
    }

    /// Change a conversation title
    pub async fn rename_conversation(&self, id: &str, title: &str) -> StoreResult<()> {
        let id = id.to_string();
        let title = title.to_string();
        self.with_conn(move |conn| {
            let now = timestamp(Utc::now());
            let changed = conn.execute(
                "UPDATE conversations SET title = ?1, updated_at = MAX(updated_at, ?2) WHERE id = ?3",
                params![title, now, id],
            )?;
            if changed == 0 {
                return Err(StoreError::conversation_not_found(&id));
            }
            Ok(())
        })
        .await
    }

    /// Delete a conversation and its messages. Returns false if it did not exist.
    pub async fn delete_conversation(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM conversations WHERE id = ?1", [&id])?;
            Ok(changed > 0)
        })
        .await
    }

    /// Append a message at the end of a conversation
    pub async fn append_message(&self, new: NewMessage) -> StoreResult<Message> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
                [&new.conversation_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::conversation_not_found(&new.conversation_id));
            }

            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
                [&new.conversation_id],
                |row| row.get(0),
            )?;

            let now = Utc::now();
            let message = Message {
                id: Uuid::new_v4().to_string(),
                conversation_id: new.conversation_id,
                seq,
                role: new.role,
                content: new.content,
                status: new.status,
                failure: None,
                reply_to: new.reply_to,
                created_at: now,
                updated_at: now,
            };

            tx.execute(
                "INSERT INTO messages (id, conversation_id, seq, role, content, status,
                                       failure_kind, failure_detail, reply_to, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, ?8, ?8)",
                params![
                    message.id,
                    message.conversation_id,
                    message.seq,
                    message.role.as_str(),
                    message.content,
                    message.status.as_str(),
                    message.reply_to,
                    timestamp(now),
                ],
            )?;
            touch_conversation(&tx, &message.conversation_id, &timestamp(now))?;
            tx.commit()?;

            Ok(message)
        })
        .await
    }

    /// Overwrite content, status and failure of a message
    pub async fn update_message(
        &self,
        id: &str,
        content: &str,
        status: MessageStatus,
        failure: Option<Failure>,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let content = content.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let conversation_id = message_conversation(&tx, &id)?;
            let now = timestamp(Utc::now());

            let (kind, detail) = match &failure {
                Some(failure) => (Some(failure.kind.as_str()), failure.detail.as_deref()),
                None => (None, None),
            };
            tx.execute(
                "UPDATE messages
                 SET content = ?1, status = ?2, failure_kind = ?3, failure_detail = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![content, status.as_str(), kind, detail, now, id],
            )?;
            touch_conversation(&tx, &conversation_id, &now)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Write in-progress draft content.
    ///
    /// Only rows that are still pending or streaming are written, so a late
    /// checkpoint never replaces a finalized message. Returns whether the row
    /// was written.
    pub async fn checkpoint_message(&self, id: &str, content: &str) -> StoreResult<bool> {
        let id = id.to_string();
        let content = content.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let conversation_id = message_conversation(&tx, &id)?;
            let now = timestamp(Utc::now());

            let changed = tx.execute(
                "UPDATE messages SET content = ?1, updated_at = ?2
                 WHERE id = ?3 AND status IN ('pending', 'streaming')",
                params![content, now, id],
            )?;
            if changed > 0 {
                touch_conversation(&tx, &conversation_id, &now)?;
            }
            tx.commit()?;
            Ok(changed > 0)
        })
        .await
    }

    /// Get a message by ID
    pub async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let message = conn
                .query_row(
                    &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                    [&id],
                    message_from_row,
                )
                .optional()?;
            Ok(message)
        })
        .await
    }

    /// All messages of a conversation in order
    pub async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt.query_map([&conversation_id], message_from_row)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
        .await
    }

    /// Number of pending or streaming messages in a conversation
    pub async fn in_flight_count(&self, conversation_id: &str) -> StoreResult<usize> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ?1 AND status IN ('pending', 'streaming')",
                [&conversation_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    /// Fail every pending or streaming message left behind by an earlier process.
    ///
    /// Partial content is kept. Returns the IDs of the messages that were changed.
    pub async fn recover_interrupted(&self, conversation_id: &str) -> StoreResult<Vec<String>> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM messages
                     WHERE conversation_id = ?1 AND status IN ('pending', 'streaming')
                     ORDER BY seq ASC",
                )?;
                let rows = stmt.query_map([&conversation_id], |row| row.get::<_, String>(0))?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(row?);
                }
                ids
            };

            if !ids.is_empty() {
                let now = timestamp(Utc::now());
                tx.execute(
                    "UPDATE messages
                     SET status = 'failed', failure_kind = ?1, failure_detail = ?2, updated_at = ?3
                     WHERE conversation_id = ?4 AND status IN ('pending', 'streaming')",
                    params![
                        FailureKind::Cancelled.as_str(),
                        "interrupted before completion",
                        now,
                        conversation_id
                    ],
                )?;
                touch_conversation(&tx, &conversation_id, &now)?;
            }
            tx.commit()?;

            Ok(ids)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{Role, DEFAULT_TITLE};
    use tempfile::{tempdir, TempDir};

    async fn test_db() -> (TempDir, Database) {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_append_assigns_sequence_and_touches_conversation() {
        let (_dir, db) = test_db().await;
        let conversation = db.create_conversation(DEFAULT_TITLE).await.unwrap();

        let first = db
            .append_message(NewMessage::user(&conversation.id, "Hello"))
            .await
            .unwrap();
        let second = db
            .append_message(NewMessage::draft(&conversation.id, &first.id))
            .await
            .unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(second.role, Role::Assistant);
        assert_eq!(second.status, MessageStatus::Pending);
        assert_eq!(second.reply_to.as_deref(), Some(first.id.as_str()));

        let stored = db.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert!(stored.updated_at >= stored.created_at);
        assert!(stored.updated_at >= conversation.updated_at);

        let messages = db.list_messages(&conversation.id).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_append_to_unknown_conversation_fails() {
        let (_dir, db) = test_db().await;
        let err = db
            .append_message(NewMessage::user("missing", "Hello"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_unknown_message_is_not_found() {
        let (_dir, db) = test_db().await;
        let err = db
            .update_message("nope", "x", MessageStatus::Complete, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "message", .. }));
    }

    #[tokio::test]
    async fn test_update_persists_failure() {
        let (_dir, db) = test_db().await;
        let conversation = db.create_conversation("t").await.unwrap();
        let user = db
            .append_message(NewMessage::user(&conversation.id, "Hello"))
            .await
            .unwrap();
        let draft = db
            .append_message(NewMessage::draft(&conversation.id, &user.id))
            .await
            .unwrap();

        db.update_message(
            &draft.id,
            "Hi",
            MessageStatus::Failed,
            Some(Failure::new(FailureKind::Timeout, "no data for 60s")),
        )
        .await
        .unwrap();

        let stored = db.get_message(&draft.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Hi");
        assert_eq!(stored.status, MessageStatus::Failed);
        let failure = stored.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.detail.as_deref(), Some("no data for 60s"));
    }

    #[tokio::test]
    async fn test_checkpoint_never_overwrites_finalized_message() {
        let (_dir, db) = test_db().await;
        let conversation = db.create_conversation("t").await.unwrap();
        let user = db
            .append_message(NewMessage::user(&conversation.id, "Hello"))
            .await
            .unwrap();
        let draft = db
            .append_message(NewMessage::draft(&conversation.id, &user.id))
            .await
            .unwrap();

        assert!(db.checkpoint_message(&draft.id, "Hi").await.unwrap());
        db.update_message(&draft.id, "Hi there", MessageStatus::Complete, None)
            .await
            .unwrap();
        assert!(!db.checkpoint_message(&draft.id, "Hi").await.unwrap());

        let stored = db.get_message(&draft.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Hi there");
        assert_eq!(stored.status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn test_recover_interrupted_fails_in_flight_messages() {
        let (_dir, db) = test_db().await;
        let conversation = db.create_conversation("t").await.unwrap();
        let user = db
            .append_message(NewMessage::user(&conversation.id, "Hello"))
            .await
            .unwrap();
        let draft = db
            .append_message(NewMessage::draft(&conversation.id, &user.id))
            .await
            .unwrap();
        db.update_message(&draft.id, "Hi th", MessageStatus::Streaming, None)
            .await
            .unwrap();

        let recovered = db.recover_interrupted(&conversation.id).await.unwrap();
        assert_eq!(recovered, vec![draft.id.clone()]);
        assert_eq!(db.in_flight_count(&conversation.id).await.unwrap(), 0);

        let stored = db.get_message(&draft.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Hi th");
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.failure.unwrap().kind, FailureKind::Cancelled);

        assert!(db.recover_interrupted(&conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_rename_and_delete_conversations() {
        let (_dir, db) = test_db().await;
        let older = db.create_conversation("older").await.unwrap();
        let newer = db.create_conversation("newer").await.unwrap();
        db.append_message(NewMessage::user(&older.id, "bump"))
            .await
            .unwrap();

        let listed = db.list_conversations(None).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, older.id);

        let limited = db.list_conversations(Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);

        db.rename_conversation(&newer.id, "renamed").await.unwrap();
        let renamed = db.get_conversation(&newer.id).await.unwrap().unwrap();
        assert_eq!(renamed.title, "renamed");
        assert!(db.rename_conversation("missing", "x").await.is_err());

        assert!(db.delete_conversation(&older.id).await.unwrap());
        assert!(!db.delete_conversation(&older.id).await.unwrap());
        assert!(db.list_messages(&older.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_separate_conversations() {
        let (_dir, db) = test_db().await;
        let a = db.create_conversation("a").await.unwrap();
        let b = db.create_conversation("b").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let db = db.clone();
            let conversation_id = if i % 2 == 0 { a.id.clone() } else { b.id.clone() };
            tasks.push(tokio::spawn(async move {
                db.append_message(NewMessage::user(conversation_id, format!("m{}", i)))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let seqs: Vec<i64> = db
            .list_messages(&a.id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.seq)
            .collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
        assert_eq!(db.list_messages(&b.id).await.unwrap().len(), 10);
        assert!(db.pool.state().connections <= MAX_CONNECTIONS);
    }

    #[tokio::test]
    async fn test_pooled_connections_are_configured() {
        let (_dir, db) = test_db().await;
        let (foreign_keys, journal_mode) = db
            .with_conn(|conn| {
                let foreign_keys: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
                let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
                Ok((foreign_keys, journal_mode))
            })
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);
        assert_eq!(journal_mode, "wal");
    }
}
