//! Poller-side view of one durable cursor.
//!
//! Wraps a `CursorStore` row with the configured floor and an in-memory
//! copy of the last position, so a failed write only costs a retry on the
//! next batch instead of re-reading a stale value.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::store::traits::CursorStore;

/// A single source's cursor (`chat-archive`, `bot-api`, `email:<account>`).
pub struct Cursor {
    store: Arc<dyn CursorStore>,
    key: String,
    floor: i64,
    current: Option<i64>,
    /// Set when the last write failed; cleared once a write lands.
    dirty: bool,
}

impl Cursor {
    pub fn new(store: Arc<dyn CursorStore>, key: impl Into<String>, floor: i64) -> Self {
        Self {
            store,
            key: key.into(),
            floor,
            current: None,
            dirty: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current position. On first use reads the store; a missing row or a
    /// read failure yields the floor, and a stored value below the floor is
    /// raised to it.
    pub async fn get_position(&mut self) -> i64 {
        if let Some(position) = self.current {
            return position;
        }

        let position = match self.store.load_cursor(&self.key).await {
            Ok(Some(stored)) => stored.max(self.floor),
            Ok(None) => self.floor,
            Err(e) => {
                warn!(key = %self.key, floor = self.floor, "Cursor read failed, using floor: {e}");
                self.floor
            }
        };
        debug!(key = %self.key, position, "Cursor loaded");
        self.current = Some(position);
        position
    }

    /// Advance to `position`. Values at or below the current position are
    /// ignored (unless an earlier write is still pending). Returns whether the
    /// store now holds the latest position.
    pub async fn set_position(&mut self, position: i64) -> bool {
        let current = self.get_position().await;
        if position <= current && !self.dirty {
            return true;
        }
        let target = position.max(current);
        self.current = Some(target);

        match self.store.save_cursor(&self.key, target).await {
            Ok(stored) => {
                self.dirty = false;
                if stored > target {
                    // Another writer already moved the row further.
                    self.current = Some(stored);
                }
                true
            }
            Err(e) => {
                self.dirty = true;
                error!(key = %self.key, position = target, "Cursor write failed, will retry: {e}");
                false
            }
        }
    }
}
