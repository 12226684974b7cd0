//! Reply routing: sends handler replies back where a message came from.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::channels::BotApi;
use crate::collaborators::Notifier;
use crate::pipeline::types::{Source, UnifiedMessage};

/// Routes replies by source.
///
/// - chat-archive: read-only, replies are dropped
/// - bot-api: `sendMessage` to the originating chat
/// - email: forwarded to the notification webhook
#[derive(Clone, Default)]
pub struct Replier {
    bot: Option<Arc<dyn BotApi>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Replier {
    pub fn new(bot: Option<Arc<dyn BotApi>>, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self { bot, notifier }
    }

    /// Send a reply. Returns whether it was delivered; failures are logged.
    pub async fn reply(&self, message: &UnifiedMessage, text: &str) -> bool {
        match message.source {
            Source::ChatArchive => {
                debug!(id = %message.source_message_id, "Chat archive is read-only; reply dropped");
                false
            }
            Source::BotApi => {
                let Some(bot) = &self.bot else {
                    debug!("No bot client configured; reply dropped");
                    return false;
                };
                let Some(chat_id) = chat_id(&message.raw_payload) else {
                    warn!(id = %message.source_message_id, "Bot message has no chat id; reply dropped");
                    return false;
                };
                match bot.send_message(chat_id, text).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(chat_id, "Failed to send reply: {e}");
                        false
                    }
                }
            }
            Source::Email => {
                let Some(notifier) = &self.notifier else {
                    debug!("No notifier configured; email reply dropped");
                    return false;
                };
                match notifier.notify(text).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(id = %message.source_message_id, "Failed to send notification: {e}");
                        false
                    }
                }
            }
        }
    }
}

/// Chat id of a bot update (`message` or `channel_post`).
fn chat_id(update: &Value) -> Option<i64> {
    ["message", "channel_post"]
        .iter()
        .find_map(|key| update.get(key)?.get("chat")?.get("id")?.as_i64())
}
