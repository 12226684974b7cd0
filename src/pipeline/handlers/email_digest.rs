//! Email digest: summarizes each new email and notifies the operator.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::channels::email::preview;
use crate::collaborators::Summary;
use crate::error::HandlerError;
use crate::pipeline::handlers::{Handler, HandlerDeps};
use crate::pipeline::types::{Source, UnifiedMessage};

/// Characters of body shown when no summary is available.
const PREVIEW_CHARS: usize = 200;

pub struct EmailDigestHandler {
    deps: Arc<HandlerDeps>,
}

impl EmailDigestHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }

    async fn summarize(&self, subject: &str, body: &str) -> Option<Summary> {
        let summarizer = self.deps.summarizer.as_ref()?;
        match summarizer.summarize(subject, body).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(subject, "Email summary failed, falling back to preview: {e}");
                None
            }
        }
    }
}

/// Notification text for one email.
fn digest_text(from: &str, subject: &str, summary: Option<&Summary>, body: &str) -> String {
    let mut text = format!("📧 New email\nFrom: {from}\nSubject: {subject}\n");
    match summary {
        Some(summary) => {
            text.push_str(&format!("Importance: {}\n\n{}", summary.importance.label(), summary.summary));
            if !summary.action_items.is_empty() {
                text.push_str("\n\nAction items:");
                for item in &summary.action_items {
                    text.push_str(&format!("\n- {item}"));
                }
            }
        }
        None => {
            text.push('\n');
            text.push_str(&preview(body, PREVIEW_CHARS));
        }
    }
    text
}

#[async_trait]
impl Handler for EmailDigestHandler {
    fn name(&self) -> &'static str {
        "email_digest"
    }

    fn matches(&self, message: &UnifiedMessage) -> bool {
        message.source == Source::Email
    }

    async fn handle(&self, message: &UnifiedMessage) -> Result<(), HandlerError> {
        let subject = message.raw_str(&["subject"]).unwrap_or("(no subject)");
        let summary = self.summarize(subject, &message.content).await;
        let text = digest_text(&message.from_user, subject, summary.as_ref(), &message.content);

        if self.deps.reply(message, &text).await {
            info!(id = %message.source_message_id, "Email digest sent");
        }
        Ok(())
    }
}
