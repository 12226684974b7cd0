//! In-memory collaborators for handler and dispatcher tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::channels::telegram::RemoteFile;
use crate::channels::BotApi;
use crate::collaborators::{
    Block, Classifier, Decision, NoteClient, NoteTarget, Notifier, ObjectStorage, Page,
    PageFetcher, Summarizer, Summary,
};
use crate::error::{ChannelError, CollaboratorError};
use crate::pipeline::formatter::BlockFormatter;
use crate::pipeline::handlers::HandlerDeps;
use crate::pipeline::reply::Replier;
use crate::pipeline::types::{MessageType, Source, UnifiedMessage};
use crate::store::LibSqlBackend;

pub fn text_message(source: Source, content: &str) -> UnifiedMessage {
    let raw = match source {
        Source::BotApi => serde_json::json!({"update_id": 1, "message": {"chat": {"id": 42}}}),
        Source::Email => serde_json::json!({"subject": "Hello"}),
        Source::ChatArchive => Value::Null,
    };
    UnifiedMessage::new(source, "m1", MessageType::Text, "alice", content, 0).with_raw(raw)
}

// ── Note API ────────────────────────────────────────────────────────

/// Scripted save outcomes.
#[derive(Debug, Clone, Copy)]
pub enum SaveOutcome {
    Accepted,
    Refused,
    RateLimited,
    Unreachable,
}

#[derive(Default)]
pub struct FakeNotes {
    pub saved: Mutex<Vec<(Vec<Block>, NoteTarget)>>,
    script: Mutex<VecDeque<SaveOutcome>>,
    attempts: AtomicUsize,
    /// Title returned by `verify_access`; `None` means access is denied.
    pub title: Mutex<Option<String>>,
}

impl FakeNotes {
    pub fn push(&self, outcome: SaveOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn push_rate_limit(&self) {
        self.push(SaveOutcome::RateLimited);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn saved_blocks(&self) -> Vec<Vec<Block>> {
        self.saved.lock().unwrap().iter().map(|(b, _)| b.clone()).collect()
    }
}

#[async_trait]
impl NoteClient for FakeNotes {
    async fn save_blocks(
        &self,
        blocks: &[Block],
        target: &NoteTarget,
    ) -> Result<bool, CollaboratorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SaveOutcome::Accepted);
        match outcome {
            SaveOutcome::Accepted => {
                self.saved
                    .lock()
                    .unwrap()
                    .push((blocks.to_vec(), target.clone()));
                Ok(true)
            }
            SaveOutcome::Refused => Ok(false),
            SaveOutcome::RateLimited => Err(CollaboratorError::Rejected {
                service: "notes",
                status: 429,
            }),
            SaveOutcome::Unreachable => Err(CollaboratorError::RequestFailed {
                service: "notes",
                reason: "connection refused".into(),
            }),
        }
    }

    async fn verify_access(&self, _target: &NoteTarget) -> Result<String, CollaboratorError> {
        self.title
            .lock()
            .unwrap()
            .clone()
            .ok_or(CollaboratorError::Rejected {
                service: "notes",
                status: 401,
            })
    }
}

// ── Reply channels ──────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeBot {
    pub sent: Mutex<Vec<(i64, String)>>,
}

impl FakeBot {
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl BotApi for FakeBot {
    async fn get_updates(&self, _offset: i64, _timeout: u64) -> Result<Vec<Value>, ChannelError> {
        Ok(Vec::new())
    }

    async fn download_file(&self, _file_id: &str) -> Result<RemoteFile, ChannelError> {
        Err(ChannelError::InvalidMessage("not supported".into()))
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    pub sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, text: &str) -> Result<(), CollaboratorError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

// ── Agents ──────────────────────────────────────────────────────────

/// Returns the configured summary; `None` makes the call fail.
#[derive(Default)]
pub struct FakeSummarizer {
    pub summary: Mutex<Option<Summary>>,
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn summarize(
        &self,
        _subject: &str,
        _body: &str,
    ) -> Result<Option<Summary>, CollaboratorError> {
        match self.summary.lock().unwrap().clone() {
            Some(summary) => Ok(Some(summary)),
            None => Err(CollaboratorError::InvalidResponse {
                service: "summarizer",
                reason: "no JSON".into(),
            }),
        }
    }
}

/// Returns the configured decision; `None` makes the call fail.
#[derive(Default)]
pub struct FakeClassifier {
    pub decision: Mutex<Option<Decision>>,
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, _text: &str) -> Result<Decision, CollaboratorError> {
        self.decision
            .lock()
            .unwrap()
            .clone()
            .ok_or(CollaboratorError::RequestFailed {
                service: "classifier",
                reason: "timeout".into(),
            })
    }
}

// ── Storage and pages ───────────────────────────────────────────────

#[derive(Default)]
pub struct FakeStorage {
    pub base: String,
    pub uploaded: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(&self, path: &Path) -> Result<Option<String>, CollaboratorError> {
        self.uploaded.lock().unwrap().push(path.to_path_buf());
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
        Ok(Some(format!("{}/{name}", self.base)))
    }
}

/// Returns the configured page; `None` makes the fetch fail.
#[derive(Default)]
pub struct FakePages {
    pub page: Mutex<Option<Page>>,
}

#[async_trait]
impl PageFetcher for FakePages {
    async fn fetch(&self, url: &str) -> Result<Page, CollaboratorError> {
        self.page
            .lock()
            .unwrap()
            .clone()
            .ok_or(CollaboratorError::RequestFailed {
                service: "web",
                reason: format!("{url} unreachable"),
            })
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// A full set of fakes plus an in-memory database.
pub struct Harness {
    pub db: Arc<LibSqlBackend>,
    pub notes: Arc<FakeNotes>,
    pub bot: Arc<FakeBot>,
    pub notifier: Arc<FakeNotifier>,
    pub summarizer: Option<Arc<FakeSummarizer>>,
    pub classifier: Option<Arc<FakeClassifier>>,
    pub storage: Option<Arc<FakeStorage>>,
    pub pages: Arc<FakePages>,
    pub default_target: Option<NoteTarget>,
    pub public_base_url: Option<String>,
}

impl Harness {
    pub async fn new() -> Self {
        Self {
            db: Arc::new(LibSqlBackend::new_memory().await.unwrap()),
            notes: Arc::new(FakeNotes::default()),
            bot: Arc::new(FakeBot::default()),
            notifier: Arc::new(FakeNotifier::default()),
            summarizer: Some(Arc::new(FakeSummarizer::default())),
            classifier: Some(Arc::new(FakeClassifier::default())),
            storage: None,
            pages: Arc::new(FakePages::default()),
            default_target: Some(NoteTarget {
                link_id: "link".into(),
                document_id: "inbox".into(),
                token: None,
            }),
            public_base_url: None,
        }
    }

    pub fn deps(&self) -> Arc<HandlerDeps> {
        Arc::new(HandlerDeps {
            notes: self.notes.clone(),
            bindings: self.db.clone(),
            default_target: self.default_target.clone(),
            formatter: BlockFormatter::new(self.public_base_url.clone()),
            replier: Replier::new(Some(self.bot.clone()), Some(self.notifier.clone())),
            summarizer: self
                .summarizer
                .clone()
                .map(|s| s as Arc<dyn Summarizer>),
            classifier: self
                .classifier
                .clone()
                .map(|c| c as Arc<dyn Classifier>),
            storage: self.storage.clone().map(|s| s as Arc<dyn ObjectStorage>),
            pages: self.pages.clone(),
        })
    }
}
