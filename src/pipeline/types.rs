//! Shared types for the ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Source ──────────────────────────────────────────────────────────

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// Enterprise chat archive (encrypted envelopes fetched by sequence).
    ChatArchive,
    /// Bot long-polling API (`getUpdates`).
    BotApi,
    /// IMAP mailboxes.
    Email,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatArchive => "chat-archive",
            Self::BotApi => "bot-api",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat-archive" => Ok(Self::ChatArchive),
            "bot-api" => Ok(Self::BotApi),
            "email" => Ok(Self::Email),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

// ── Message type ────────────────────────────────────────────────────

/// Content kind of a normalized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    File,
    Link,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::File => "file",
            Self::Link => "link",
        }
    }

    /// Whether the content is (normally) a downloaded file path.
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::File)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "file" => Ok(Self::File),
            "link" => Ok(Self::Link),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

// ── Unified message ─────────────────────────────────────────────────

/// Normalized message from any source.
///
/// Source pollers convert their native records into this struct.
/// `(source, source_message_id)` identifies a message globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    /// Source-native identifier (msgid, message_id, `account:uid`).
    pub source_message_id: String,
    pub source: Source,
    pub message_type: MessageType,
    /// Sender identity in source-native form.
    pub from_user: String,
    /// Text payload, local file path for downloaded media, or URL for links.
    pub content: String,
    /// Source-reported creation time (unix seconds).
    pub created_at: i64,
    /// Full original record.
    pub raw_payload: serde_json::Value,
}

impl UnifiedMessage {
    pub fn new(
        source: Source,
        source_message_id: impl Into<String>,
        message_type: MessageType,
        from_user: impl Into<String>,
        content: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            source_message_id: source_message_id.into(),
            source,
            message_type,
            from_user: from_user.into(),
            content: content.into(),
            created_at,
            raw_payload: serde_json::Value::Null,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw_payload = raw;
        self
    }

    /// Short display label used in log lines.
    pub fn label(&self) -> String {
        format!("{}:{}", self.source, self.source_message_id)
    }

    /// Look up a string field in the raw payload by path.
    pub fn raw_str(&self, path: &[&str]) -> Option<&str> {
        let mut value = &self.raw_payload;
        for key in path {
            value = value.get(key)?;
        }
        value.as_str()
    }
}
