//! Content handlers and the ordered chain that selects one per message.
//!
//! The chain is built once at startup and never changes. For each message
//! the first handler whose `matches` returns true runs; the rest are
//! skipped. `matches` is pure and cheap, `handle` may touch the network.

mod bind;
mod email_digest;
mod fallback;
mod forward;
mod keyword;
mod link;
mod media;
mod question;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::collaborators::{
    Block, Classifier, NoteClient, NoteTarget, ObjectStorage, PageFetcher, Summarizer,
};
use crate::error::{CollaboratorError, HandlerError};
use crate::pipeline::formatter::BlockFormatter;
use crate::pipeline::reply::Replier;
use crate::pipeline::types::UnifiedMessage;
use crate::store::BindingStore;

pub use bind::BindHandler;
pub use email_digest::EmailDigestHandler;
pub use fallback::FallbackHandler;
pub use forward::ForwardHandler;
pub use keyword::{FilmQuoteHandler, PingHandler};
pub use link::LinkHandler;
pub use media::MediaHandler;
pub use question::QuestionHandler;

/// Delay before retrying a rate-limited note save.
const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A content handler.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this handler takes the message. Must not do I/O.
    fn matches(&self, message: &UnifiedMessage) -> bool;

    /// React to the message. Predictable collaborator failures are handled
    /// inside (usually with a reply); an `Err` stops the chain walk.
    async fn handle(&self, message: &UnifiedMessage) -> Result<(), HandlerError>;
}

// ── Chain ───────────────────────────────────────────────────────────

/// Immutable, priority-ordered handler list.
pub struct HandlerChain {
    handlers: Vec<Box<dyn Handler>>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Box<dyn Handler>>) -> Self {
        Self { handlers }
    }

    /// The standard chain: bind, email digest, forward, ping, film quote,
    /// link, question, media, fallback.
    pub fn standard(deps: Arc<HandlerDeps>) -> Self {
        Self::new(vec![
            Box::new(BindHandler::new(Arc::clone(&deps))),
            Box::new(EmailDigestHandler::new(Arc::clone(&deps))),
            Box::new(ForwardHandler::new(Arc::clone(&deps))),
            Box::new(PingHandler::new(Arc::clone(&deps))),
            Box::new(FilmQuoteHandler::new(Arc::clone(&deps))),
            Box::new(LinkHandler::new(Arc::clone(&deps))),
            Box::new(QuestionHandler::new(Arc::clone(&deps))),
            Box::new(MediaHandler::new(Arc::clone(&deps))),
            Box::new(FallbackHandler::new(deps)),
        ])
    }

    /// First handler whose predicate accepts the message.
    pub fn select(&self, message: &UnifiedMessage) -> Option<&dyn Handler> {
        self.handlers
            .iter()
            .find(|h| h.matches(message))
            .map(|h| h.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── Shared dependencies ─────────────────────────────────────────────

/// Collaborators shared by all handlers.
pub struct HandlerDeps {
    pub notes: Arc<dyn NoteClient>,
    pub bindings: Arc<dyn BindingStore>,
    /// Document used for senders without a binding.
    pub default_target: Option<NoteTarget>,
    pub formatter: BlockFormatter,
    pub replier: Replier,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub classifier: Option<Arc<dyn Classifier>>,
    pub storage: Option<Arc<dyn ObjectStorage>>,
    pub pages: Arc<dyn PageFetcher>,
}

impl HandlerDeps {
    /// The sender's bound document, else the default one.
    pub async fn target_for(&self, sender: &str) -> Option<NoteTarget> {
        match self.bindings.get_binding(sender).await {
            Ok(Some(binding)) => return Some(NoteTarget::from(&binding)),
            Ok(None) => {}
            Err(e) => warn!(sender, "Binding lookup failed, using default target: {e}"),
        }
        self.default_target.clone()
    }

    /// Save blocks to the sender's document.
    ///
    /// `Ok(false)` when there is no target or the API refused the blocks.
    /// A rate-limited save is retried once.
    pub async fn save_for(
        &self,
        sender: &str,
        blocks: &[Block],
    ) -> Result<bool, CollaboratorError> {
        let Some(target) = self.target_for(sender).await else {
            warn!(sender, "No binding and no default note target; nothing saved");
            return Ok(false);
        };
        save_with_retry(self.notes.as_ref(), blocks, &target).await
    }

    pub async fn reply(&self, message: &UnifiedMessage, text: &str) -> bool {
        self.replier.reply(message, text).await
    }
}

/// `save_blocks` with one retry on HTTP 429.
pub async fn save_with_retry(
    notes: &dyn NoteClient,
    blocks: &[Block],
    target: &NoteTarget,
) -> Result<bool, CollaboratorError> {
    match notes.save_blocks(blocks, target).await {
        Err(CollaboratorError::Rejected { status: 429, .. }) => {
            info!("Note API rate limited; retrying once");
            tokio::time::sleep(RATE_LIMIT_RETRY_DELAY).await;
            notes.save_blocks(blocks, target).await
        }
        other => other,
    }
}
