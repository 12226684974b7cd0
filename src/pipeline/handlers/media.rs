//! Media handler: uploads downloaded files and saves them as blocks.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::HandlerError;
use crate::pipeline::handlers::{Handler, HandlerDeps};
use crate::pipeline::types::{MessageType, UnifiedMessage};

pub struct MediaHandler {
    deps: Arc<HandlerDeps>,
}

impl MediaHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }

    /// Public URL for the message's file: uploaded when storage is
    /// configured, otherwise derived by the formatter.
    async fn resolve_url(&self, message: &UnifiedMessage) -> Option<String> {
        let path = Path::new(&message.content);
        if let Some(storage) = &self.deps.storage
            && path.is_file()
        {
            match storage.upload(path).await {
                Ok(Some(url)) => return Some(url),
                Ok(None) => warn!(path = %path.display(), "Upload returned no URL"),
                Err(e) => warn!(path = %path.display(), "Upload failed: {e}"),
            }
        }
        self.deps.formatter.public_url(&message.content)
    }
}

fn kind(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Image => "image",
        MessageType::Video => "video",
        _ => "file",
    }
}

#[async_trait]
impl Handler for MediaHandler {
    fn name(&self) -> &'static str {
        "media"
    }

    fn matches(&self, message: &UnifiedMessage) -> bool {
        message.message_type.is_media()
    }

    async fn handle(&self, message: &UnifiedMessage) -> Result<(), HandlerError> {
        let kind = kind(message.message_type);
        info!(id = %message.source_message_id, kind, "Processing media");

        let blocks = match self.resolve_url(message).await {
            Some(url) => vec![self.deps.formatter.media_block(message, url)],
            None => self.deps.formatter.format(message),
        };

        let saved = match self.deps.save_for(&message.from_user, &blocks).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!(id = %message.source_message_id, "Saving media failed: {e}");
                false
            }
        };

        let reply = if saved {
            format!("📎 Received {kind}, saved to your inbox")
        } else {
            format!("⚠️ Failed to save {kind}")
        };
        self.deps.reply(message, &reply).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Block;
    use crate::pipeline::testing::{FakeStorage, Harness};
    use crate::pipeline::types::Source;

    fn media(message_type: MessageType, content: &str) -> UnifiedMessage {
        UnifiedMessage::new(Source::BotApi, "5", message_type, "alice", content, 0)
            .with_raw(serde_json::json!({"message": {"chat": {"id": 7}}}))
    }

    #[tokio::test]
    async fn uploads_local_file_when_storage_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tg_7_5.jpg");
        std::fs::write(&path, b"jpg").unwrap();
        let mut harness = Harness::new().await;
        harness.storage = Some(Arc::new(FakeStorage {
            base: "https://bucket.example.com".into(),
            ..Default::default()
        }));
        let handler = MediaHandler::new(harness.deps());
        let msg = media(MessageType::Image, path.to_str().unwrap());

        assert!(handler.matches(&msg));
        handler.handle(&msg).await.unwrap();

        assert_eq!(
            harness.notes.saved_blocks()[0],
            vec![Block::Image {
                url: "https://bucket.example.com/tg_7_5.jpg".into()
            }]
        );
        assert_eq!(
            harness.storage.as_ref().unwrap().uploaded.lock().unwrap().len(),
            1
        );
        assert_eq!(
            harness.bot.texts(),
            vec!["📎 Received image, saved to your inbox".to_string()]
        );
    }

    #[tokio::test]
    async fn falls_back_to_public_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"mp4").unwrap();
        let mut harness = Harness::new().await;
        harness.public_base_url = Some("https://media.example.com".into());
        let handler = MediaHandler::new(harness.deps());

        handler
            .handle(&media(MessageType::Video, path.to_str().unwrap()))
            .await
            .unwrap();

        assert!(matches!(
            &harness.notes.saved_blocks()[0][0],
            Block::File { url, file_name, .. }
                if url == "https://media.example.com/clip.mp4" && file_name == "clip.mp4"
        ));
    }

    #[tokio::test]
    async fn failed_download_is_saved_as_description() {
        let harness = Harness::new().await;
        let handler = MediaHandler::new(harness.deps());

        handler
            .handle(&media(MessageType::File, r#"{"sdkfileid":"abc"}"#))
            .await
            .unwrap();

        assert!(matches!(
            &harness.notes.saved_blocks()[0][0],
            Block::Text { markdown } if markdown.contains("sdkfileid")
        ));
    }
}
