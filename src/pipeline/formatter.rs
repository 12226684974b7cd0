//! Maps unified messages to note blocks.

use std::path::Path;

use reqwest::Url;

use crate::collaborators::Block;
use crate::pipeline::types::{MessageType, UnifiedMessage};

/// Turns messages into note blocks, resolving local media paths to public URLs.
#[derive(Debug, Clone, Default)]
pub struct BlockFormatter {
    public_base_url: Option<String>,
}

impl BlockFormatter {
    pub fn new(public_base_url: Option<String>) -> Self {
        Self { public_base_url }
    }

    /// Public URL for message content: URLs pass through, existing local
    /// files map to `<public base>/<file name>`.
    pub fn public_url(&self, content: &str) -> Option<String> {
        if is_url(content) {
            return Some(content.to_string());
        }
        let path = Path::new(content);
        if !path.is_file() {
            return None;
        }
        let name = path.file_name()?.to_str()?;
        self.url_for_name(name)
    }

    fn url_for_name(&self, name: &str) -> Option<String> {
        let base = self.public_base_url.as_deref()?;
        let mut url = Url::parse(base).ok()?;
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .push(name);
        Some(url.to_string())
    }

    /// Blocks for a message.
    pub fn format(&self, message: &UnifiedMessage) -> Vec<Block> {
        match message.message_type {
            MessageType::Text => {
                if message.content.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![Block::text(&message.content)]
                }
            }
            MessageType::Link => vec![Block::RichUrl {
                url: message.content.clone(),
            }],
            MessageType::Image | MessageType::Video | MessageType::File => {
                match self.public_url(&message.content) {
                    Some(url) => vec![self.media_block(message, url)],
                    None => vec![missing_media(message)],
                }
            }
        }
    }

    /// Block for a media message whose public URL is already known.
    pub fn media_block(&self, message: &UnifiedMessage, url: String) -> Block {
        match message.message_type {
            MessageType::Image => Block::Image { url },
            _ => {
                let file_name = display_name(message, &url);
                Block::File {
                    markdown: format!("[{file_name}]({url})"),
                    url,
                    file_name,
                }
            }
        }
    }
}

fn is_url(content: &str) -> bool {
    content.starts_with("http://") || content.starts_with("https://")
}

/// Original file name from the raw payload, else the last path segment.
fn display_name(message: &UnifiedMessage, url: &str) -> String {
    message
        .raw_str(&["file", "filename"])
        .or_else(|| message.raw_str(&["message", "document", "file_name"]))
        .map(str::to_string)
        .or_else(|| {
            Path::new(&message.content)
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|_| !is_url(&message.content))
                .map(str::to_string)
        })
        .unwrap_or_else(|| url.rsplit('/').next().unwrap_or(url).to_string())
}

fn missing_media(message: &UnifiedMessage) -> Block {
    let label = match message.message_type {
        MessageType::Image => "🖼 **Image received**",
        MessageType::Video => "🎥 **Video received**",
        _ => "📁 **File received**",
    };
    if message.content.is_empty() {
        Block::text(format!("{label} (no content)"))
    } else {
        Block::text(format!("{label} (not available): `{}`", message.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Source;

    fn message(message_type: MessageType, content: &str) -> UnifiedMessage {
        UnifiedMessage::new(Source::ChatArchive, "m1", message_type, "alice", content, 0)
    }

    #[test]
    fn text_becomes_markdown_block() {
        let blocks = BlockFormatter::default().format(&message(MessageType::Text, "hello"));
        assert_eq!(blocks, vec![Block::text("hello")]);
    }

    #[test]
    fn blank_text_has_no_blocks() {
        let blocks = BlockFormatter::default().format(&message(MessageType::Text, "  "));
        assert!(blocks.is_empty());
    }

    #[test]
    fn link_becomes_rich_url() {
        let blocks =
            BlockFormatter::default().format(&message(MessageType::Link, "https://example.com/a"));
        assert_eq!(
            blocks,
            vec![Block::RichUrl {
                url: "https://example.com/a".into()
            }]
        );
    }

    #[test]
    fn local_image_maps_to_public_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media 1.jpg");
        std::fs::write(&path, b"jpg").unwrap();
        let formatter = BlockFormatter::new(Some("https://cdn.example.com/media/".into()));

        let blocks = formatter.format(&message(MessageType::Image, path.to_str().unwrap()));

        assert_eq!(
            blocks,
            vec![Block::Image {
                url: "https://cdn.example.com/media/media%201.jpg".into()
            }]
        );
    }

    #[test]
    fn file_keeps_original_name_from_raw_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media_m1_abcd1234_report.pdf");
        std::fs::write(&path, b"pdf").unwrap();
        let formatter = BlockFormatter::new(Some("https://cdn.example.com".into()));
        let msg = message(MessageType::File, path.to_str().unwrap())
            .with_raw(serde_json::json!({"file": {"filename": "report.pdf"}}));

        let blocks = formatter.format(&msg);

        let url = "https://cdn.example.com/media_m1_abcd1234_report.pdf";
        assert_eq!(
            blocks,
            vec![Block::File {
                url: url.into(),
                file_name: "report.pdf".into(),
                markdown: format!("[report.pdf]({url})"),
            }]
        );
    }

    #[test]
    fn remote_video_uses_url_segment_as_name() {
        let blocks = BlockFormatter::default()
            .format(&message(MessageType::Video, "https://cdn.example.com/v/clip.mp4"));
        assert!(matches!(
            &blocks[0],
            Block::File { file_name, .. } if file_name == "clip.mp4"
        ));
    }

    #[test]
    fn missing_media_is_described() {
        let formatter = BlockFormatter::new(Some("https://cdn.example.com".into()));
        let blocks = formatter.format(&message(MessageType::Image, "/nonexistent/x.jpg"));
        assert_eq!(
            blocks,
            vec![Block::text("🖼 **Image received** (not available): `/nonexistent/x.jpg`")]
        );
    }

    #[test]
    fn local_file_without_public_base_is_described() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"x").unwrap();
        let blocks = BlockFormatter::default().format(&message(MessageType::File, path.to_str().unwrap()));
        assert!(matches!(&blocks[0], Block::Text { markdown } if markdown.starts_with("📁")));
    }
}
