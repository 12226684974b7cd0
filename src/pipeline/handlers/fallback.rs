//! Catch-all handler: saves whatever is left to the note inbox.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::HandlerError;
use crate::pipeline::handlers::{Handler, HandlerDeps};
use crate::pipeline::types::UnifiedMessage;

pub struct FallbackHandler {
    deps: Arc<HandlerDeps>,
}

impl FallbackHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Handler for FallbackHandler {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn matches(&self, _message: &UnifiedMessage) -> bool {
        true
    }

    async fn handle(&self, message: &UnifiedMessage) -> Result<(), HandlerError> {
        let blocks = self.deps.formatter.format(message);
        if blocks.is_empty() {
            return Ok(());
        }

        match self.deps.save_for(&message.from_user, &blocks).await {
            Ok(true) => {
                info!(id = %message.source_message_id, "Saved to inbox");
                self.deps.reply(message, "✅ Saved").await;
            }
            Ok(false) => warn!(id = %message.source_message_id, "Inbox save refused"),
            Err(e) => warn!(id = %message.source_message_id, "Inbox save failed: {e}"),
        }
        Ok(())
    }
}
