//! libSQL backend: async implementation of the storage traits.
//!
//! Supports local file and in-memory databases. Uniqueness and cursor
//! monotonicity are enforced in SQL so concurrent pollers can share one
//! backend without an application-level lock.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{Source, UnifiedMessage};
use crate::store::migrations;
use crate::store::traits::{
    Binding, BindingStore, CursorRecord, CursorStore, MessageStore, StoredMessage,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const MESSAGE_COLUMNS: &str = "id, source, source_message_id, message_type, from_user, content, raw_payload, created_at, stored_at";

/// Map a libsql Row to a StoredMessage.
///
/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("row parse (col {idx}): {e}")))
    };

    let source = get_text(1)?
        .parse::<Source>()
        .map_err(DatabaseError::Serialization)?;
    let message_type = get_text(3)?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let raw_payload = serde_json::from_str(&get_text(6)?)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let created_at: i64 = row
        .get(7)
        .map_err(|e| DatabaseError::Query(format!("row parse (col 7): {e}")))?;

    Ok(StoredMessage {
        id: get_text(0)?,
        message: UnifiedMessage {
            source_message_id: get_text(2)?,
            source,
            message_type,
            from_user: get_text(4)?,
            content: get_text(5)?,
            created_at,
            raw_payload,
        },
        stored_at: parse_datetime(&get_text(8)?),
    })
}

// ── Cursors ─────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for LibSqlBackend {
    async fn load_cursor(&self, key: &str) -> Result<Option<i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT position FROM cursors WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("load_cursor: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let position: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("load_cursor: {e}")))?;
                Ok(Some(position))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_cursor: {e}"))),
        }
    }

    async fn save_cursor(&self, key: &str, position: i64) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO cursors (key, position, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET
                    position = MAX(cursors.position, excluded.position),
                    updated_at = excluded.updated_at
                 RETURNING position",
                params![key, position, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_cursor: {e}")))?;

        let stored = match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("save_cursor: {e}")))?,
            Ok(None) => position,
            Err(e) => return Err(DatabaseError::Query(format!("save_cursor: {e}"))),
        };

        debug!(key, requested = position, stored, "Cursor saved");
        Ok(stored)
    }

    async fn list_cursors(&self) -> Result<Vec<CursorRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT key, position, updated_at FROM cursors ORDER BY key", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_cursors: {e}")))?;

        let mut cursors = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let key: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("list_cursors: {e}")))?;
                    let position: i64 = row
                        .get(1)
                        .map_err(|e| DatabaseError::Query(format!("list_cursors: {e}")))?;
                    let updated: String = row
                        .get(2)
                        .map_err(|e| DatabaseError::Query(format!("list_cursors: {e}")))?;
                    cursors.push(CursorRecord {
                        key,
                        position,
                        updated_at: parse_datetime(&updated),
                    });
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_cursors: {e}"))),
            }
        }
        Ok(cursors)
    }
}

// ── Messages ────────────────────────────────────────────────────────

#[async_trait]
impl MessageStore for LibSqlBackend {
    async fn exists(
        &self,
        source: Source,
        source_message_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM unified_messages WHERE source = ?1 AND source_message_id = ?2",
                params![source.as_str(), source_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("exists: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("exists: {e}"))),
        }
    }

    async fn save(&self, message: &UnifiedMessage) -> Result<bool, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let raw = serde_json::to_string(&message.raw_payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let affected = self
            .conn()
            .execute(
                "INSERT INTO unified_messages (id, source, source_message_id, message_type,
                    from_user, content, raw_payload, created_at, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (source, source_message_id) DO NOTHING",
                params![
                    id.clone(),
                    message.source.as_str(),
                    message.source_message_id.clone(),
                    message.message_type.as_str(),
                    message.from_user.clone(),
                    message.content.clone(),
                    raw,
                    message.created_at,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_message: {e}")))?;

        let inserted = affected > 0;
        debug!(
            id = %id,
            key = %message.label(),
            inserted,
            "Unified message save"
        );
        Ok(inserted)
    }

    async fn get_message(
        &self,
        source: Source,
        source_message_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM unified_messages
                     WHERE source = ?1 AND source_message_id = ?2"
                ),
                params![source.as_str(), source_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message: {e}"))),
        }
    }

    async fn count_messages(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM unified_messages", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_messages: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_messages: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_messages: {e}"))),
        }
    }
}

// ── Bindings ────────────────────────────────────────────────────────

#[async_trait]
impl BindingStore for LibSqlBackend {
    async fn upsert_binding(&self, binding: &Binding) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO bindings (sender, link_id, document_id, token, display_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (sender) DO UPDATE SET
                    link_id = ?2, document_id = ?3, token = ?4, display_name = ?5, updated_at = ?6",
                params![
                    binding.sender.clone(),
                    binding.link_id.clone(),
                    binding.document_id.clone(),
                    opt_text(binding.token.as_deref()),
                    opt_text(binding.display_name.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_binding: {e}")))?;

        info!(sender = %binding.sender, link_id = %binding.link_id, "Binding saved");
        Ok(())
    }

    async fn get_binding(&self, sender: &str) -> Result<Option<Binding>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT sender, link_id, document_id, token, display_name
                 FROM bindings WHERE sender = ?1",
                params![sender],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_binding: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let text = |idx: i32| -> Result<String, DatabaseError> {
                    row.get::<String>(idx)
                        .map_err(|e| DatabaseError::Query(format!("get_binding: {e}")))
                };
                Ok(Some(Binding {
                    sender: text(0)?,
                    link_id: text(1)?,
                    document_id: text(2)?,
                    token: row.get::<String>(3).ok(),
                    display_name: row.get::<String>(4).ok(),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_binding: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::MessageType;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_message(id: &str, content: &str) -> UnifiedMessage {
        UnifiedMessage::new(Source::ChatArchive, id, MessageType::Text, "alice", content, 1_700_000_000)
            .with_raw(serde_json::json!({"msgid": id}))
    }

    // ── Cursor tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn cursor_missing_returns_none() {
        let db = test_db().await;
        assert_eq!(db.load_cursor("chat-archive").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cursor_save_and_load() {
        let db = test_db().await;
        assert_eq!(db.save_cursor("bot-api", 42).await.unwrap(), 42);
        assert_eq!(db.load_cursor("bot-api").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let db = test_db().await;
        db.save_cursor("chat-archive", 105).await.unwrap();
        let stored = db.save_cursor("chat-archive", 100).await.unwrap();
        assert_eq!(stored, 105);
        assert_eq!(db.load_cursor("chat-archive").await.unwrap(), Some(105));
    }

    #[tokio::test]
    async fn cursor_same_value_is_idempotent() {
        let db = test_db().await;
        db.save_cursor("email:me@x.com", 7).await.unwrap();
        db.save_cursor("email:me@x.com", 7).await.unwrap();
        assert_eq!(db.load_cursor("email:me@x.com").await.unwrap(), Some(7));
        assert_eq!(db.list_cursors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cursor_monotonic_across_batches() {
        let db = test_db().await;
        let mut previous = 0;
        for position in [3, 9, 4, 9, 15, 1, 20] {
            db.save_cursor("chat-archive", position).await.unwrap();
            let current = db.load_cursor("chat-archive").await.unwrap().unwrap();
            assert!(current >= previous, "{current} < {previous}");
            previous = current;
        }
        assert_eq!(previous, 20);
    }

    #[tokio::test]
    async fn list_cursors_sorted_by_key() {
        let db = test_db().await;
        db.save_cursor("email:b@x.com", 2).await.unwrap();
        db.save_cursor("bot-api", 10).await.unwrap();
        db.save_cursor("email:a@x.com", 1).await.unwrap();

        let keys: Vec<String> = db
            .list_cursors()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.key)
            .collect();
        assert_eq!(keys, vec!["bot-api", "email:a@x.com", "email:b@x.com"]);
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn save_then_exists() {
        let db = test_db().await;
        let msg = make_message("m-1", "hello");
        assert!(!db.exists(Source::ChatArchive, "m-1").await.unwrap());
        assert!(db.save(&msg).await.unwrap());
        assert!(db.exists(Source::ChatArchive, "m-1").await.unwrap());
        assert!(!db.exists(Source::BotApi, "m-1").await.unwrap());
    }

    #[tokio::test]
    async fn second_save_is_noop() {
        let db = test_db().await;
        assert!(db.save(&make_message("m-1", "first")).await.unwrap());
        assert!(!db.save(&make_message("m-1", "second")).await.unwrap());
        assert_eq!(db.count_messages().await.unwrap(), 1);

        let stored = db.get_message(Source::ChatArchive, "m-1").await.unwrap().unwrap();
        assert_eq!(stored.message.content, "first");
    }

    #[tokio::test]
    async fn same_id_different_source_is_distinct() {
        let db = test_db().await;
        let mut other = make_message("m-1", "x");
        other.source = Source::BotApi;
        assert!(db.save(&make_message("m-1", "x")).await.unwrap());
        assert!(db.save(&other).await.unwrap());
        assert_eq!(db.count_messages().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn get_message_round_trips_fields() {
        let db = test_db().await;
        let msg = UnifiedMessage::new(
            Source::BotApi,
            "99",
            MessageType::Link,
            "bob",
            "https://example.com",
            1_700_000_123,
        )
        .with_raw(serde_json::json!({"message": {"chat": {"id": 5}}}));
        db.save(&msg).await.unwrap();

        let stored = db.get_message(Source::BotApi, "99").await.unwrap().unwrap();
        assert_eq!(stored.message, msg);
        assert!(!stored.id.is_empty());
    }

    #[tokio::test]
    async fn get_message_not_found() {
        let db = test_db().await;
        assert!(db.get_message(Source::Email, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_saves_keep_one_row() {
        let db = Arc::new(test_db().await);
        let a = make_message("race", "version a");
        let b = make_message("race", "version b");

        let (db_a, db_b) = (Arc::clone(&db), Arc::clone(&db));
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { db_a.save(&a).await }),
            tokio::spawn(async move { db_b.save(&b).await }),
        );
        let inserted = [ra.unwrap().unwrap(), rb.unwrap().unwrap()];

        assert_eq!(inserted.iter().filter(|i| **i).count(), 1);
        assert_eq!(db.count_messages().await.unwrap(), 1);
        let stored = db.get_message(Source::ChatArchive, "race").await.unwrap().unwrap();
        assert!(stored.message.content == "version a" || stored.message.content == "version b");
    }

    // ── Binding tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn binding_upsert_and_get() {
        let db = test_db().await;
        let binding = Binding {
            sender: "zhangsan".into(),
            link_id: "link-1".into(),
            document_id: "doc-1".into(),
            token: Some("pdk_1".into()),
            display_name: None,
        };
        db.upsert_binding(&binding).await.unwrap();
        assert_eq!(db.get_binding("zhangsan").await.unwrap(), Some(binding));
    }

    #[tokio::test]
    async fn binding_upsert_replaces_existing() {
        let db = test_db().await;
        let mut binding = Binding {
            sender: "zhangsan".into(),
            link_id: "link-1".into(),
            document_id: "doc-1".into(),
            token: None,
            display_name: Some("Inbox".into()),
        };
        db.upsert_binding(&binding).await.unwrap();
        binding.document_id = "doc-2".into();
        db.upsert_binding(&binding).await.unwrap();

        let fetched = db.get_binding("zhangsan").await.unwrap().unwrap();
        assert_eq!(fetched.document_id, "doc-2");
        assert_eq!(fetched.token, None);
        assert_eq!(fetched.display_name.as_deref(), Some("Inbox"));
    }

    #[tokio::test]
    async fn binding_missing_returns_none() {
        let db = test_db().await;
        assert!(db.get_binding("nobody").await.unwrap().is_none());
    }
}
