//! Persistence traits: cursors, unified messages, and sender bindings.
//!
//! Each concern gets its own small trait so pollers, the dispatcher and
//! handlers only see the slice of storage they touch. `LibSqlBackend`
//! implements all of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::{Source, UnifiedMessage};

/// A persisted cursor row.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CursorRecord {
    pub key: String,
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

/// A persisted unified message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub message: UnifiedMessage,
    pub stored_at: DateTime<Utc>,
}

/// A sender's note-document binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Source-native sender identity.
    pub sender: String,
    pub link_id: String,
    pub document_id: String,
    /// Per-document token; falls back to the global API token when absent.
    pub token: Option<String>,
    pub display_name: Option<String>,
}

/// Durable per-source position tracking.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the stored position, or `None` if the cursor was never written.
    async fn load_cursor(&self, key: &str) -> Result<Option<i64>, DatabaseError>;

    /// Store a position. The stored value never moves backwards; the
    /// returned value is what the row holds after the write.
    async fn save_cursor(&self, key: &str, position: i64) -> Result<i64, DatabaseError>;

    /// All cursors, ordered by key.
    async fn list_cursors(&self) -> Result<Vec<CursorRecord>, DatabaseError>;
}

/// Deduplicating store of normalized messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Whether a message with this key was already recorded.
    async fn exists(&self, source: Source, source_message_id: &str)
    -> Result<bool, DatabaseError>;

    /// Record a message. Returns `false` (not an error) when the
    /// `(source, source_message_id)` key is already present.
    async fn save(&self, message: &UnifiedMessage) -> Result<bool, DatabaseError>;

    /// Fetch a stored message by key.
    async fn get_message(
        &self,
        source: Source,
        source_message_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Total number of stored messages.
    async fn count_messages(&self) -> Result<u64, DatabaseError>;
}

/// Sender → note document bindings.
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Create or replace the binding for `binding.sender`.
    async fn upsert_binding(&self, binding: &Binding) -> Result<(), DatabaseError>;

    async fn get_binding(&self, sender: &str) -> Result<Option<Binding>, DatabaseError>;
}
