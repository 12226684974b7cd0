//! Forwards chat-archive messages to the sender's note document.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::HandlerError;
use crate::pipeline::handlers::{Handler, HandlerDeps};
use crate::pipeline::types::{Source, UnifiedMessage};

pub struct ForwardHandler {
    deps: Arc<HandlerDeps>,
}

impl ForwardHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn matches(&self, message: &UnifiedMessage) -> bool {
        message.source == Source::ChatArchive
    }

    async fn handle(&self, message: &UnifiedMessage) -> Result<(), HandlerError> {
        let blocks = self.deps.formatter.format(message);
        if blocks.is_empty() {
            warn!(id = %message.source_message_id, "Nothing to forward");
            return Ok(());
        }

        match self.deps.save_for(&message.from_user, &blocks).await {
            Ok(true) => {
                info!(id = %message.source_message_id, sender = %message.from_user, "Forwarded");
            }
            Ok(false) => {
                error!(id = %message.source_message_id, "Forward refused by note API");
                self.deps
                    .reply(message, "⚠️ Forwarding to notes failed, please try again later")
                    .await;
            }
            Err(e) => {
                error!(id = %message.source_message_id, "Forward failed: {e}");
                self.deps
                    .reply(message, &format!("⚠️ Forwarding error: {e}"))
                    .await;
            }
        }
        Ok(())
    }
}
