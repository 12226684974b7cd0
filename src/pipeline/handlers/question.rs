//! Short-text handler: answers questions, files everything else as a note.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::collaborators::{Block, Decision};
use crate::error::HandlerError;
use crate::pipeline::handlers::link::contains_url;
use crate::pipeline::handlers::{Handler, HandlerDeps};
use crate::pipeline::types::{MessageType, UnifiedMessage};

const MIN_CHARS: usize = 2;
const MAX_CHARS: usize = 500;

pub struct QuestionHandler {
    deps: Arc<HandlerDeps>,
}

impl QuestionHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }

    async fn save_note(&self, message: &UnifiedMessage, title: Option<&str>) -> bool {
        let mut blocks = Vec::new();
        if let Some(title) = title.filter(|t| !t.trim().is_empty()) {
            blocks.push(Block::text(format!("**{}**", title.trim())));
        }
        blocks.extend(self.deps.formatter.format(message));

        match self.deps.save_for(&message.from_user, &blocks).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!(id = %message.source_message_id, "Saving note failed: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl Handler for QuestionHandler {
    fn name(&self) -> &'static str {
        "question"
    }

    fn matches(&self, message: &UnifiedMessage) -> bool {
        if message.message_type != MessageType::Text || self.deps.classifier.is_none() {
            return false;
        }
        let text = message.content.trim();
        let len = text.chars().count();
        (MIN_CHARS..=MAX_CHARS).contains(&len) && !contains_url(text)
    }

    async fn handle(&self, message: &UnifiedMessage) -> Result<(), HandlerError> {
        let Some(classifier) = &self.deps.classifier else {
            return Ok(());
        };

        match classifier.classify(message.content.trim()).await {
            Ok(Decision {
                is_question: true,
                reply,
                ..
            }) => {
                let reply = reply.unwrap_or_else(|| "Got your question.".to_string());
                self.deps.reply(message, &reply).await;
                info!(id = %message.source_message_id, "Answered question");
            }
            Ok(decision) => {
                let text = if self.save_note(message, decision.saved_title.as_deref()).await {
                    "✅ Saved to notes"
                } else {
                    "⚠️ Save failed, please retry"
                };
                self.deps.reply(message, text).await;
            }
            Err(e) => {
                warn!(id = %message.source_message_id, "Classification failed, saving as-is: {e}");
                if self.save_note(message, None).await {
                    self.deps.reply(message, "✅ Message saved").await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{Harness, text_message};
    use crate::pipeline::types::Source;

    fn decide(harness: &Harness, decision: Decision) {
        *harness.classifier.as_ref().unwrap().decision.lock().unwrap() = Some(decision);
    }

    #[tokio::test]
    async fn length_and_url_rules() {
        let harness = Harness::new().await;
        let handler = QuestionHandler::new(harness.deps());

        assert!(handler.matches(&text_message(Source::BotApi, "hi")));
        assert!(!handler.matches(&text_message(Source::BotApi, "a")));
        assert!(!handler.matches(&text_message(Source::BotApi, &"字".repeat(501))));
        assert!(handler.matches(&text_message(Source::BotApi, &"字".repeat(500))));
        assert!(!handler.matches(&text_message(Source::BotApi, "see https://x.io")));
    }

    #[tokio::test]
    async fn disabled_without_classifier() {
        let mut harness = Harness::new().await;
        harness.classifier = None;
        let handler = QuestionHandler::new(harness.deps());
        assert!(!handler.matches(&text_message(Source::BotApi, "what is this?")));
    }

    #[tokio::test]
    async fn question_gets_agent_reply() {
        let harness = Harness::new().await;
        decide(
            &harness,
            Decision {
                is_question: true,
                reply: Some("It is 3pm.".into()),
                saved_title: None,
            },
        );
        let handler = QuestionHandler::new(harness.deps());

        handler
            .handle(&text_message(Source::BotApi, "what time is it?"))
            .await
            .unwrap();

        assert_eq!(harness.bot.texts(), vec!["It is 3pm.".to_string()]);
        assert!(harness.notes.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn note_is_saved_under_title() {
        let harness = Harness::new().await;
        decide(
            &harness,
            Decision {
                is_question: false,
                reply: None,
                saved_title: Some("Groceries".into()),
            },
        );
        let handler = QuestionHandler::new(harness.deps());

        handler
            .handle(&text_message(Source::BotApi, "buy milk and eggs"))
            .await
            .unwrap();

        assert_eq!(
            harness.notes.saved_blocks()[0],
            vec![Block::text("**Groceries**"), Block::text("buy milk and eggs")]
        );
        assert_eq!(harness.bot.texts(), vec!["✅ Saved to notes".to_string()]);
    }

    #[tokio::test]
    async fn classifier_failure_saves_as_is() {
        let harness = Harness::new().await;
        let handler = QuestionHandler::new(harness.deps());

        handler
            .handle(&text_message(Source::BotApi, "remember the keys"))
            .await
            .unwrap();

        assert_eq!(
            harness.notes.saved_blocks()[0],
            vec![Block::text("remember the keys")]
        );
        assert_eq!(harness.bot.texts(), vec!["✅ Message saved".to_string()]);
    }
}
