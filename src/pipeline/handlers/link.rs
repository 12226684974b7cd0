//! Link handler: saves the first URL in a message with a short summary.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::collaborators::Block;
use crate::error::HandlerError;
use crate::pipeline::handlers::{Handler, HandlerDeps};
use crate::pipeline::types::{MessageType, UnifiedMessage};

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("valid URL regex"));

/// Page text passed to the summarizer.
const SUMMARY_INPUT_CHARS: usize = 4000;

/// First URL in `text`, trailing punctuation removed.
pub fn extract_url(text: &str) -> Option<&str> {
    let url = URL_RE
        .find(text)?
        .as_str()
        .trim_end_matches(['.', ',', ';', '!', '?']);
    Some(url)
}

pub fn contains_url(text: &str) -> bool {
    text.contains("http://") || text.contains("https://")
}

pub struct LinkHandler {
    deps: Arc<HandlerDeps>,
}

impl LinkHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }

    async fn summarize(&self, title: &str, page_text: &str) -> Option<String> {
        let summarizer = self.deps.summarizer.as_ref()?;
        if page_text.trim().is_empty() {
            return None;
        }
        let input: String = page_text.chars().take(SUMMARY_INPUT_CHARS).collect();
        match summarizer.summarize(title, &input).await {
            Ok(summary) => summary.map(|s| s.summary),
            Err(e) => {
                warn!(title, "Link summary failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl Handler for LinkHandler {
    fn name(&self) -> &'static str {
        "link"
    }

    fn matches(&self, message: &UnifiedMessage) -> bool {
        match message.message_type {
            MessageType::Link => true,
            MessageType::Text => contains_url(&message.content),
            _ => false,
        }
    }

    async fn handle(&self, message: &UnifiedMessage) -> Result<(), HandlerError> {
        let Some(url) = extract_url(&message.content) else {
            warn!(id = %message.source_message_id, "No URL found in link message");
            return Ok(());
        };
        info!(id = %message.source_message_id, url, "Processing link");

        let page = match self.deps.pages.fetch(url).await {
            Ok(page) => page,
            Err(e) => {
                warn!(url, "Page fetch failed: {e}");
                Default::default()
            }
        };
        let title = message
            .raw_str(&["link", "title"])
            .map(str::to_string)
            .or(page.title)
            .unwrap_or_else(|| "Untitled link".to_string());
        let summary = self.summarize(&title, &page.text).await;

        let mut blocks = vec![Block::RichUrl {
            url: url.to_string(),
        }];
        if let Some(summary) = &summary {
            blocks.push(Block::text(format!("📝 {summary}")));
        }

        let saved = match self.deps.save_for(&message.from_user, &blocks).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!(url, "Saving link failed: {e}");
                false
            }
        };

        let reply = if saved {
            let mut text = format!("Saved: {title}");
            if let Some(summary) = &summary {
                text.push_str(&format!("\n\n📝 Summary: {summary}"));
            }
            text
        } else {
            "⚠️ Failed to save link".to_string()
        };
        self.deps.reply(message, &reply).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Page, Summary};
    use crate::pipeline::testing::{Harness, SaveOutcome, text_message};
    use crate::pipeline::types::Source;

    #[test]
    fn extract_url_trims_punctuation() {
        assert_eq!(
            extract_url("see https://example.com/a?b=1. thanks"),
            Some("https://example.com/a?b=1")
        );
        assert_eq!(extract_url("http://x.io!?"), Some("http://x.io"));
        assert_eq!(extract_url("no links here"), None);
    }

    #[tokio::test]
    async fn saves_rich_url_with_summary() {
        let harness = Harness::new().await;
        *harness.pages.page.lock().unwrap() = Some(Page {
            title: Some("Rust 2024".into()),
            text: "Edition notes".into(),
        });
        *harness.summarizer.as_ref().unwrap().summary.lock().unwrap() = Some(Summary {
            summary: "What changed".into(),
            importance: Default::default(),
            action_items: Vec::new(),
        });
        let handler = LinkHandler::new(harness.deps());
        let msg = text_message(Source::BotApi, "read this https://blog.example.com/rust.");

        assert!(handler.matches(&msg));
        handler.handle(&msg).await.unwrap();

        assert_eq!(
            harness.notes.saved_blocks()[0],
            vec![
                Block::RichUrl {
                    url: "https://blog.example.com/rust".into()
                },
                Block::text("📝 What changed"),
            ]
        );
        assert_eq!(
            harness.bot.texts(),
            vec!["Saved: Rust 2024\n\n📝 Summary: What changed".to_string()]
        );
    }

    #[tokio::test]
    async fn unreachable_page_still_saves_link() {
        let harness = Harness::new().await;
        let handler = LinkHandler::new(harness.deps());
        let msg = UnifiedMessage::new(
            Source::BotApi,
            "9",
            MessageType::Link,
            "alice",
            "https://example.com",
            0,
        )
        .with_raw(serde_json::json!({"message": {"chat": {"id": 1}}}));

        handler.handle(&msg).await.unwrap();

        assert_eq!(harness.notes.saved_blocks()[0].len(), 1);
        assert_eq!(harness.bot.texts(), vec!["Saved: Untitled link".to_string()]);
    }

    #[tokio::test]
    async fn archive_title_wins_over_page_title() {
        let harness = Harness::new().await;
        *harness.pages.page.lock().unwrap() = Some(Page {
            title: Some("Page".into()),
            text: String::new(),
        });
        let handler = LinkHandler::new(harness.deps());
        let msg = UnifiedMessage::new(
            Source::BotApi,
            "9",
            MessageType::Link,
            "alice",
            "https://example.com",
            0,
        )
        .with_raw(serde_json::json!({
            "link": {"title": "Shared Article"},
            "message": {"chat": {"id": 1}}
        }));

        handler.handle(&msg).await.unwrap();

        assert_eq!(harness.bot.texts(), vec!["Saved: Shared Article".to_string()]);
    }

    #[tokio::test]
    async fn refused_save_replies_with_warning() {
        let harness = Harness::new().await;
        harness.notes.push(SaveOutcome::Refused);
        let handler = LinkHandler::new(harness.deps());

        handler
            .handle(&text_message(Source::BotApi, "https://example.com"))
            .await
            .unwrap();

        assert_eq!(harness.bot.texts(), vec!["⚠️ Failed to save link".to_string()]);
    }
}
