//! External collaborators called by handlers.
//!
//! Each one is a black box behind a trait: the note API, the LLM agents,
//! object storage, the notification webhook, and page fetching for links.
//! Handlers only depend on these traits; `main` wires the HTTP/rig
//! implementations in.

pub mod craft;
pub mod llm;
pub mod notify;
pub mod storage;
pub mod web;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::store::Binding;

pub use craft::CraftClient;
pub use llm::{LlmAgents, LlmBackend, LlmConfig};
pub use notify::WebhookNotifier;
pub use storage::HttpObjectStorage;
pub use web::HttpPageFetcher;

// ── Note blocks ─────────────────────────────────────────────────────

/// A block appended to a note document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Block {
    #[serde(rename = "text")]
    Text { markdown: String },
    #[serde(rename = "image")]
    Image { url: String },
    #[serde(rename = "file")]
    File {
        url: String,
        #[serde(rename = "fileName")]
        file_name: String,
        markdown: String,
    },
    #[serde(rename = "richUrl")]
    RichUrl { url: String },
}

impl Block {
    pub fn text(markdown: impl Into<String>) -> Self {
        Self::Text {
            markdown: markdown.into(),
        }
    }
}

/// Destination document for `save_blocks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteTarget {
    pub link_id: String,
    pub document_id: String,
    /// Document token; the client's global token is used when absent.
    pub token: Option<String>,
}

impl From<&Binding> for NoteTarget {
    fn from(binding: &Binding) -> Self {
        Self {
            link_id: binding.link_id.clone(),
            document_id: binding.document_id.clone(),
            token: binding.token.clone(),
        }
    }
}

// ── Agent results ───────────────────────────────────────────────────

/// How urgent an email looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    #[default]
    Medium,
    Low,
}

impl Importance {
    pub fn label(&self) -> &'static str {
        match self {
            Self::High => "🔴 high",
            Self::Medium => "🟡 medium",
            Self::Low => "🟢 low",
        }
    }
}

/// Email summary produced by the summarizer agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Summary {
    pub summary: String,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub action_items: Vec<String>,
}

/// Classifier verdict for a short text message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decision {
    pub is_question: bool,
    /// Answer to send back when `is_question`.
    pub reply: Option<String>,
    /// Title to file the text under when it is a note.
    pub saved_title: Option<String>,
}

/// Fetched web page, reduced to what the link handler needs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub title: Option<String>,
    pub text: String,
}

// ── Traits ──────────────────────────────────────────────────────────

/// Note-taking document API.
#[async_trait]
pub trait NoteClient: Send + Sync {
    /// Append blocks to the end of the target document. `Ok(false)` means
    /// the API answered but did not accept the blocks.
    async fn save_blocks(
        &self,
        blocks: &[Block],
        target: &NoteTarget,
    ) -> Result<bool, CollaboratorError>;

    /// Check that the target is reachable; returns a display title.
    async fn verify_access(&self, target: &NoteTarget) -> Result<String, CollaboratorError>;
}

/// Summarizes an email into a short digest.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        subject: &str,
        body: &str,
    ) -> Result<Option<Summary>, CollaboratorError>;
}

/// Decides whether a text is a question to answer or a note to keep.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Decision, CollaboratorError>;
}

/// Uploads a local file and returns its public URL.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, path: &Path) -> Result<Option<String>, CollaboratorError>;
}

/// Sends a plain-text notification to the operator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), CollaboratorError>;
}

/// Fetches a web page for link previews.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Page, CollaboratorError>;
}
