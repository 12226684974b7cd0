//! Bot-API source: long-polls `getUpdates` and replies with `sendMessage`.
//!
//! The offset is persisted per update: once an update has been handed to
//! the sink its `update_id` becomes the cursor, and the next request asks
//! for `update_id + 1`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channels::media::{sanitize_file_name, write_atomically};
use crate::channels::{MessageSink, Poller};
use crate::error::ChannelError;
use crate::pipeline::types::{MessageType, Source, UnifiedMessage};
use crate::store::Cursor;

const NAME: &str = "bot-api";

/// Default Bot API host.
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// A file fetched through `getFile`.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub bytes: Vec<u8>,
    /// Server-side path, e.g. `photos/file_12.jpg`.
    pub remote_path: String,
}

/// The slice of the Bot API the relay uses.
#[async_trait]
pub trait BotApi: Send + Sync {
    /// Updates with `update_id >= offset`, waiting up to `timeout_secs`.
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Value>, ChannelError>;

    async fn download_file(&self, file_id: &str) -> Result<RemoteFile, ChannelError>;

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError>;
}

// ── Client ──────────────────────────────────────────────────────────

/// HTTP Bot API client.
pub struct TelegramClient {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: TELEGRAM_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at another host (local Bot API server, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    fn file_url(&self, remote_path: &str) -> String {
        format!(
            "{}/file/bot{}/{remote_path}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Unwrap a Bot API envelope (`{ok, result}` / `{ok, error_code, description}`).
    async fn call(&self, request: reqwest::RequestBuilder) -> Result<Value, ChannelError> {
        let resp = request.send().await.map_err(|e| ChannelError::Http {
            name: NAME.into(),
            // Strip the URL: it embeds the bot token.
            reason: e.without_url().to_string(),
        })?;

        let status = resp.status();
        if status.as_u16() == 409 {
            return Err(ChannelError::Conflict { name: NAME.into() });
        }

        let data: Value = resp.json().await.map_err(|e| ChannelError::Http {
            name: NAME.into(),
            reason: format!("status {status}: {}", e.without_url()),
        })?;

        if data.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(ChannelError::Api {
                name: NAME.into(),
                code: data
                    .get("error_code")
                    .and_then(Value::as_i64)
                    .unwrap_or(i64::from(status.as_u16())),
                message: data
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        let markdown = self
            .call(self.client.post(self.api_url("sendMessage")).json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown"
            })))
            .await;

        let Err(markdown_err) = markdown else {
            return Ok(());
        };
        warn!("Telegram sendMessage with Markdown failed; retrying without parse_mode: {markdown_err}");

        self.call(self.client.post(self.api_url("sendMessage")).json(&serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        })))
        .await
        .map(|_| ())
        .map_err(|plain_err| ChannelError::SendFailed {
            name: NAME.into(),
            reason: format!("sendMessage failed (markdown: {markdown_err}, plain: {plain_err})"),
        })
    }
}

#[async_trait]
impl BotApi for TelegramClient {
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Value>, ChannelError> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message", "channel_post"]
        });
        let result = self
            .call(
                self.client
                    .post(self.api_url("getUpdates"))
                    .timeout(Duration::from_secs(timeout_secs + 5))
                    .json(&body),
            )
            .await?;

        match result {
            Value::Array(updates) => Ok(updates),
            other => Err(ChannelError::InvalidMessage(format!(
                "getUpdates result is not an array: {other}"
            ))),
        }
    }

    async fn download_file(&self, file_id: &str) -> Result<RemoteFile, ChannelError> {
        let info = self
            .call(
                self.client
                    .get(self.api_url("getFile"))
                    .timeout(Duration::from_secs(10))
                    .query(&[("file_id", file_id)]),
            )
            .await?;
        let remote_path = info
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::InvalidMessage("getFile without file_path".into()))?
            .to_string();

        let resp = self
            .client
            .get(self.file_url(&remote_path))
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| ChannelError::Http {
                name: NAME.into(),
                reason: e.without_url().to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(ChannelError::Http {
                name: NAME.into(),
                reason: format!("file download returned {}", resp.status()),
            });
        }
        let bytes = resp.bytes().await.map_err(|e| ChannelError::Http {
            name: NAME.into(),
            reason: e.without_url().to_string(),
        })?;

        Ok(RemoteFile {
            bytes: bytes.to_vec(),
            remote_path,
        })
    }

    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }
}

// ── Update parsing ──────────────────────────────────────────────────

/// Media referenced by an update, still on Telegram's servers.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRef {
    pub file_id: String,
    pub file_name: Option<String>,
    /// The media JSON, used as content if the download fails.
    pub descriptor: Value,
}

/// A normalized update, before media download.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUpdate {
    pub message: UnifiedMessage,
    pub media: Option<MediaRef>,
}

/// Turn a raw update into a message. Returns `None` for updates without a
/// message or with content the relay does not handle (stickers, polls, ...).
pub fn parse_update(update: &Value) -> Option<ParsedUpdate> {
    let message = update
        .get("message")
        .or_else(|| update.get("channel_post"))?;
    let message_id = message.get("message_id").and_then(Value::as_i64)?;
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?;
    let created_at = message.get("date").and_then(Value::as_i64).unwrap_or(0);
    let sender = sender_name(message);
    let caption = message
        .get("caption")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let (message_type, content, media) = if let Some(text) =
        message.get("text").and_then(Value::as_str)
    {
        let kind = if is_bare_url(text) {
            MessageType::Link
        } else {
            MessageType::Text
        };
        (kind, text.trim().to_string(), None)
    } else if let Some(photo) = largest_photo(message) {
        (MessageType::Image, caption.to_string(), media_ref(photo))
    } else if let Some(video) = message.get("video") {
        (MessageType::Video, caption.to_string(), media_ref(video))
    } else if let Some(document) = message.get("document") {
        (MessageType::File, caption.to_string(), media_ref(document))
    } else {
        return None;
    };

    let unified = UnifiedMessage::new(
        Source::BotApi,
        format!("{chat_id}:{message_id}"),
        message_type,
        sender,
        content,
        created_at,
    )
    .with_raw(update.clone());

    Some(ParsedUpdate {
        message: unified,
        media,
    })
}

/// `from.username`, else `first_name last_name`, else the chat title.
fn sender_name(message: &Value) -> String {
    let from = message.get("from");
    if let Some(username) = from
        .and_then(|f| f.get("username"))
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
    {
        return username.to_string();
    }
    let part = |key: &str| {
        from.and_then(|f| f.get(key))
            .and_then(Value::as_str)
            .unwrap_or_default()
    };
    let full = format!("{} {}", part("first_name"), part("last_name"))
        .trim()
        .to_string();
    if !full.is_empty() {
        return full;
    }
    message
        .get("chat")
        .and_then(|c| c.get("title"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

/// Telegram lists photo sizes smallest first.
fn largest_photo(message: &Value) -> Option<&Value> {
    message
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| {
            sizes
                .iter()
                .max_by_key(|p| p.get("file_size").and_then(Value::as_u64).unwrap_or(0))
                .or_else(|| sizes.last())
        })
}

fn media_ref(media: &Value) -> Option<MediaRef> {
    let file_id = media.get("file_id").and_then(Value::as_str)?.to_string();
    Some(MediaRef {
        file_id,
        file_name: media
            .get("file_name")
            .and_then(Value::as_str)
            .map(str::to_string),
        descriptor: media.clone(),
    })
}

/// A message consisting of nothing but one http(s) URL.
pub fn is_bare_url(text: &str) -> bool {
    let text = text.trim();
    (text.starts_with("http://") || text.starts_with("https://"))
        && !text.chars().any(char::is_whitespace)
}

/// Local name for a downloaded file: `tg_<chat>_<msg>` plus the original
/// name or the remote extension.
fn local_file_name(source_message_id: &str, media: &MediaRef, remote_path: &str) -> String {
    let base = format!("tg_{}", source_message_id.replace([':', '-'], "_"));
    if let Some(name) = media.file_name.as_deref().map(sanitize_file_name)
        && !name.is_empty()
    {
        return format!("{base}_{name}");
    }
    let ext = Path::new(remote_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg");
    format!("{base}.{ext}")
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Never cut inside a multi-byte character.
        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }

        // Find a good split point
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Poller ──────────────────────────────────────────────────────────

/// Long-polls the Bot API and emits one message per usable update.
pub struct TelegramPoller {
    api: Arc<dyn BotApi>,
    cursor: Cursor,
    sink: Arc<dyn MessageSink>,
    media_dir: PathBuf,
    poll_timeout_secs: u64,
}

impl TelegramPoller {
    pub fn new(
        api: Arc<dyn BotApi>,
        cursor: Cursor,
        sink: Arc<dyn MessageSink>,
        media_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            cursor,
            sink,
            media_dir: media_dir.into(),
            poll_timeout_secs: 20,
        }
    }

    pub fn with_poll_timeout(mut self, secs: u64) -> Self {
        self.poll_timeout_secs = secs;
        self
    }

    /// Download referenced media; content becomes the local path, or the
    /// media JSON when the download fails.
    async fn fetch_media(&self, message: &mut UnifiedMessage, media: &MediaRef) {
        let result = match self.api.download_file(&media.file_id).await {
            Ok(file) => {
                let name = local_file_name(&message.source_message_id, media, &file.remote_path);
                write_atomically(&self.media_dir, &name, &file.bytes)
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(path) => {
                debug!(path = %path.display(), "Telegram media saved");
                message.content = path.to_string_lossy().to_string();
            }
            Err(reason) => {
                warn!(id = %message.source_message_id, "Telegram media download failed: {reason}");
                message.content = media.descriptor.to_string();
            }
        }
    }
}

#[async_trait]
impl Poller for TelegramPoller {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn poll_once(&mut self) -> Result<usize, ChannelError> {
        let last = self.cursor.get_position().await;
        let updates = self.api.get_updates(last + 1, self.poll_timeout_secs).await?;
        let mut emitted = 0;

        for update in &updates {
            let Some(update_id) = update.get("update_id").and_then(Value::as_i64) else {
                warn!("Update without update_id, skipping");
                continue;
            };
            if update_id <= last {
                continue;
            }

            match parse_update(update) {
                Some(ParsedUpdate {
                    mut message,
                    media,
                }) => {
                    if let Some(media) = media {
                        self.fetch_media(&mut message, &media).await;
                    }
                    info!(id = %message.source_message_id, from = %message.from_user, kind = %message.message_type, "Telegram message received");
                    self.sink.submit(message).await;
                    emitted += 1;
                }
                None => debug!(update_id, "Ignoring update without usable content"),
            }

            self.cursor.set_position(update_id).await;
        }

        Ok(emitted)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::store::{CursorStore, LibSqlBackend};

    fn text_update(update_id: i64, text: &str) -> Value {
        json!({
            "update_id": update_id,
            "message": {
                "message_id": update_id * 10,
                "from": {"id": 7, "first_name": "Ada", "last_name": "Lovelace"},
                "chat": {"id": 555, "type": "private"},
                "date": 1_700_000_000,
                "text": text
            }
        })
    }

    // ── Basic client tests ──────────────────────────────────────────

    #[test]
    fn telegram_api_url() {
        let client = TelegramClient::new(SecretString::from("123:ABC"));
        assert_eq!(
            client.api_url("getUpdates"),
            "https://api.telegram.org/bot123:ABC/getUpdates"
        );
        assert_eq!(
            client.file_url("photos/a.jpg"),
            "https://api.telegram.org/file/bot123:ABC/photos/a.jpg"
        );
    }

    #[test]
    fn telegram_api_base_override() {
        let client =
            TelegramClient::new(SecretString::from("t")).with_api_base("http://localhost:8081/");
        assert_eq!(client.api_url("getMe"), "http://localhost:8081/bott/getMe");
    }

    // ── Parsing tests ───────────────────────────────────────────────

    #[test]
    fn parse_text_update() {
        let parsed = parse_update(&text_update(1, "hello there")).unwrap();
        let msg = parsed.message;
        assert_eq!(msg.source, Source::BotApi);
        assert_eq!(msg.source_message_id, "555:10");
        assert_eq!(msg.message_type, MessageType::Text);
        assert_eq!(msg.from_user, "Ada Lovelace");
        assert_eq!(msg.content, "hello there");
        assert_eq!(msg.created_at, 1_700_000_000);
        assert_eq!(msg.raw_payload["message"]["chat"]["id"], 555);
        assert!(parsed.media.is_none());
    }

    #[test]
    fn parse_bare_url_is_link() {
        let parsed = parse_update(&text_update(1, " https://example.com/post?id=1 ")).unwrap();
        assert_eq!(parsed.message.message_type, MessageType::Link);
        assert_eq!(parsed.message.content, "https://example.com/post?id=1");

        let parsed = parse_update(&text_update(2, "see https://example.com")).unwrap();
        assert_eq!(parsed.message.message_type, MessageType::Text);
    }

    #[test]
    fn parse_prefers_username() {
        let update = json!({
            "update_id": 1,
            "message": {
                "message_id": 3,
                "from": {"id": 7, "username": "ada", "first_name": "Ada"},
                "chat": {"id": 9},
                "date": 1,
                "text": "hi"
            }
        });
        assert_eq!(parse_update(&update).unwrap().message.from_user, "ada");
    }

    #[test]
    fn parse_photo_picks_largest_size() {
        let update = json!({
            "update_id": 1,
            "message": {
                "message_id": 3,
                "chat": {"id": 9, "title": "Family"},
                "date": 1,
                "caption": "sunset",
                "photo": [
                    {"file_id": "small", "file_size": 100},
                    {"file_id": "big", "file_size": 9000},
                    {"file_id": "mid", "file_size": 3000}
                ]
            }
        });
        let parsed = parse_update(&update).unwrap();
        assert_eq!(parsed.message.message_type, MessageType::Image);
        assert_eq!(parsed.message.from_user, "Family");
        assert_eq!(parsed.message.content, "sunset");
        assert_eq!(parsed.media.unwrap().file_id, "big");
    }

    #[test]
    fn parse_document_keeps_file_name() {
        let update = json!({
            "update_id": 1,
            "message": {
                "message_id": 3,
                "from": {"username": "ada"},
                "chat": {"id": 9},
                "date": 1,
                "document": {"file_id": "doc1", "file_name": "plan.pdf"}
            }
        });
        let parsed = parse_update(&update).unwrap();
        assert_eq!(parsed.message.message_type, MessageType::File);
        assert_eq!(parsed.media.unwrap().file_name.as_deref(), Some("plan.pdf"));
    }

    #[test]
    fn parse_ignores_stickers_and_non_messages() {
        let sticker = json!({
            "update_id": 1,
            "message": {"message_id": 3, "chat": {"id": 9}, "date": 1, "sticker": {"file_id": "s"}}
        });
        assert!(parse_update(&sticker).is_none());
        assert!(parse_update(&json!({"update_id": 2, "my_chat_member": {}})).is_none());
    }

    #[test]
    fn local_file_name_prefers_original_name() {
        let media = MediaRef {
            file_id: "f".into(),
            file_name: Some("plan.pdf".into()),
            descriptor: Value::Null,
        };
        assert_eq!(
            local_file_name("-100:7", &media, "documents/file_1.pdf"),
            "tg__100_7_plan.pdf"
        );
        let photo = MediaRef {
            file_name: None,
            ..media
        };
        assert_eq!(
            local_file_name("9:7", &photo, "photos/file_2.png"),
            "tg_9_7.png"
        );
    }

    // ── Split tests ─────────────────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4096);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        // 3-byte characters: 4096 is not a boundary.
        let msg = "字".repeat(2000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.concat(), msg);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
    }

    // ── Poller tests ────────────────────────────────────────────────

    struct FakeBot {
        updates: Mutex<Vec<Result<Vec<Value>, ChannelError>>>,
        offsets: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl BotApi for FakeBot {
        async fn get_updates(&self, offset: i64, _timeout: u64) -> Result<Vec<Value>, ChannelError> {
            self.offsets.lock().unwrap().push(offset);
            self.updates.lock().unwrap().pop().unwrap_or(Ok(Vec::new()))
        }

        async fn download_file(&self, file_id: &str) -> Result<RemoteFile, ChannelError> {
            if file_id == "broken" {
                return Err(ChannelError::Http {
                    name: NAME.into(),
                    reason: "gone".into(),
                });
            }
            Ok(RemoteFile {
                bytes: b"jpeg-bytes".to_vec(),
                remote_path: "photos/file_1.jpg".into(),
            })
        }

        async fn send_message(&self, _chat_id: i64, _text: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        messages: Mutex<Vec<UnifiedMessage>>,
    }

    #[async_trait]
    impl MessageSink for CollectingSink {
        async fn submit(&self, message: UnifiedMessage) {
            self.messages.lock().unwrap().push(message);
        }
    }

    async fn poller_with(
        responses: Vec<Result<Vec<Value>, ChannelError>>,
        media_dir: &Path,
    ) -> (TelegramPoller, Arc<FakeBot>, Arc<CollectingSink>, Arc<dyn CursorStore>) {
        let mut responses = responses;
        responses.reverse();
        let bot = Arc::new(FakeBot {
            updates: Mutex::new(responses),
            offsets: Mutex::new(Vec::new()),
        });
        let store: Arc<dyn CursorStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sink = Arc::new(CollectingSink::default());
        let poller = TelegramPoller::new(
            bot.clone(),
            Cursor::new(Arc::clone(&store), "bot-api", 0),
            sink.clone(),
            media_dir,
        );
        (poller, bot, sink, store)
    }

    #[tokio::test]
    async fn offsets_advance_per_update() {
        let dir = tempfile::tempdir().unwrap();
        let sticker = json!({
            "update_id": 42,
            "message": {"message_id": 1, "chat": {"id": 1}, "date": 1, "sticker": {}}
        });
        let (mut poller, bot, sink, store) = poller_with(
            vec![
                Ok(vec![text_update(40, "a"), text_update(41, "b"), sticker]),
                Ok(vec![text_update(43, "c")]),
            ],
            dir.path(),
        )
        .await;

        assert_eq!(poller.poll_once().await.unwrap(), 2);
        assert_eq!(store.load_cursor("bot-api").await.unwrap(), Some(42));
        assert_eq!(poller.poll_once().await.unwrap(), 1);

        assert_eq!(*bot.offsets.lock().unwrap(), vec![1, 43]);
        assert_eq!(sink.messages.lock().unwrap().len(), 3);
        assert_eq!(store.load_cursor("bot-api").await.unwrap(), Some(43));
    }

    #[tokio::test]
    async fn conflict_is_returned_to_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (mut poller, _bot, _sink, store) = poller_with(
            vec![Err(ChannelError::Conflict { name: NAME.into() })],
            dir.path(),
        )
        .await;

        let err = poller.poll_once().await.unwrap_err();
        assert_eq!(err.backoff_hint(), Some(Duration::from_secs(30)));
        assert_eq!(store.load_cursor("bot-api").await.unwrap(), None);
    }

    #[tokio::test]
    async fn photo_is_downloaded_to_media_dir() {
        let dir = tempfile::tempdir().unwrap();
        let photo = json!({
            "update_id": 5,
            "message": {
                "message_id": 8,
                "from": {"username": "ada"},
                "chat": {"id": 77},
                "date": 1,
                "photo": [{"file_id": "p1", "file_size": 10}]
            }
        });
        let (mut poller, _bot, sink, _store) = poller_with(vec![Ok(vec![photo])], dir.path()).await;

        poller.poll_once().await.unwrap();

        let messages = sink.messages.lock().unwrap();
        let path = Path::new(&messages[0].content);
        assert_eq!(path.file_name().unwrap(), "tg_77_8.jpg");
        assert_eq!(std::fs::read(path).unwrap(), b"jpeg-bytes");
    }

    #[tokio::test]
    async fn failed_download_falls_back_to_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let video = json!({
            "update_id": 5,
            "message": {
                "message_id": 8,
                "from": {"username": "ada"},
                "chat": {"id": 77},
                "date": 1,
                "video": {"file_id": "broken", "duration": 3}
            }
        });
        let (mut poller, _bot, sink, _store) = poller_with(vec![Ok(vec![video])], dir.path()).await;

        poller.poll_once().await.unwrap();

        let messages = sink.messages.lock().unwrap();
        assert_eq!(messages[0].message_type, MessageType::Video);
        let descriptor: Value = serde_json::from_str(&messages[0].content).unwrap();
        assert_eq!(descriptor["file_id"], "broken");
    }

    // ── HTTP tests ──────────────────────────────────────────────────

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn get_updates_maps_409_to_conflict() {
        use axum::http::StatusCode;
        use axum::routing::post;

        let router = axum::Router::new().route(
            "/bottoken/getUpdates",
            post(|| async {
                (
                    StatusCode::CONFLICT,
                    axum::Json(json!({"ok": false, "error_code": 409, "description": "Conflict"})),
                )
            }),
        );
        let client =
            TelegramClient::new(SecretString::from("token")).with_api_base(serve(router).await);

        let err = client.get_updates(1, 0).await.unwrap_err();
        assert!(matches!(err, ChannelError::Conflict { .. }));
    }

    #[tokio::test]
    async fn send_message_retries_without_markdown() {
        use axum::routing::post;

        let calls = Arc::new(Mutex::new(Vec::<Value>::new()));
        let recorded = Arc::clone(&calls);
        let router = axum::Router::new().route(
            "/bottoken/sendMessage",
            post(move |axum::Json(body): axum::Json<Value>| {
                let recorded = Arc::clone(&recorded);
                async move {
                    let markdown = body.get("parse_mode").is_some();
                    recorded.lock().unwrap().push(body);
                    if markdown {
                        axum::Json(json!({"ok": false, "error_code": 400, "description": "can't parse entities"}))
                    } else {
                        axum::Json(json!({"ok": true, "result": {"message_id": 1}}))
                    }
                }
            }),
        );
        let client =
            TelegramClient::new(SecretString::from("token")).with_api_base(serve(router).await);

        client.send_message(555, "*unbalanced").await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1]["chat_id"], 555);
        assert!(calls[1].get("parse_mode").is_none());
    }
}
