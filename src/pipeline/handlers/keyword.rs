//! Keyword replies: a liveness check and a random film quote.
//!
//! Neither handler saves anything to notes.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::info;

use crate::error::HandlerError;
use crate::pipeline::handlers::{Handler, HandlerDeps};
use crate::pipeline::types::{MessageType, UnifiedMessage};

/// Longest message still treated as a ping, so "test" inside a sentence
/// is left to the other handlers.
const PING_MAX_CHARS: usize = 5;

const PING_REPLY: &str = "I'm your inbox agent. Go ahead and test me.";

/// (quote, film)
const FILM_QUOTES: &[(&str, &str)] = &[
    ("Life is like a box of chocolates. You never know what you're gonna get.", "Forrest Gump"),
    ("Hope is a good thing, maybe the best of things, and no good thing ever dies.", "The Shawshank Redemption"),
    ("You got a dream, you gotta protect it.", "The Pursuit of Happyness"),
    ("Never forget. Real death is when no one remembers you.", "Coco"),
    ("With great power comes great responsibility.", "Spider-Man"),
    ("Never forget who you are.", "Spirited Away"),
    ("If you don't have dreams, what's the difference from a salted fish?", "Shaolin Soccer"),
    ("My fate is up to me, not the heavens.", "Ne Zha"),
    ("Some birds aren't meant to be caged. Their feathers are just too bright.", "The Shawshank Redemption"),
    ("Whatever is kept in mind will echo back.", "The Grandmaster"),
];

fn is_text(message: &UnifiedMessage, keyword_match: impl Fn(&str) -> bool) -> bool {
    message.message_type == MessageType::Text && keyword_match(message.content.trim())
}

// ── Ping ────────────────────────────────────────────────────────────

/// Answers a short "测试" / "test" with a canned reply.
pub struct PingHandler {
    deps: Arc<HandlerDeps>,
}

impl PingHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Handler for PingHandler {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn matches(&self, message: &UnifiedMessage) -> bool {
        is_text(message, |text| {
            (text.contains("测试") || text.to_lowercase().contains("test"))
                && text.chars().count() <= PING_MAX_CHARS
        })
    }

    async fn handle(&self, message: &UnifiedMessage) -> Result<(), HandlerError> {
        info!(id = %message.source_message_id, "Ping");
        self.deps.reply(message, PING_REPLY).await;
        Ok(())
    }
}

// ── Quote ───────────────────────────────────────────────────────────

/// Replies to "台词" / "quote" with a random film quote.
pub struct FilmQuoteHandler {
    deps: Arc<HandlerDeps>,
}

impl FilmQuoteHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

fn quote_text(quote: &str, film: &str) -> String {
    format!("💬 {quote}\n\n- {film}")
}

#[async_trait]
impl Handler for FilmQuoteHandler {
    fn name(&self) -> &'static str {
        "quote"
    }

    fn matches(&self, message: &UnifiedMessage) -> bool {
        is_text(message, |text| text == "台词" || text.eq_ignore_ascii_case("quote"))
    }

    async fn handle(&self, message: &UnifiedMessage) -> Result<(), HandlerError> {
        let text = FILM_QUOTES
            .choose(&mut rand::thread_rng())
            .map(|(quote, film)| quote_text(quote, film))
            .unwrap_or_default();
        info!(id = %message.source_message_id, "Quote requested");
        self.deps.reply(message, &text).await;
        Ok(())
    }
}
