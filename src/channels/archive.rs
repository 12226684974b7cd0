//! Chat-archive source: envelope decryption and the sequence poller.
//!
//! The archive returns batches of envelopes after a sequence number. Each
//! envelope holds a symmetric key encrypted to our RSA key
//! (`encrypt_random_key`) and the AES-256-CBC encrypted message JSON
//! (`encrypt_chat_msg`). The poller decrypts each envelope on its own, so a
//! bad one only costs that message.

use std::sync::Arc;
use std::time::Duration;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channels::media::{MediaRequest, MediaRetriever};
use crate::channels::{MessageSink, Poller};
use crate::error::{ChannelError, DecryptError};
use crate::pipeline::types::{MessageType, Source, UnifiedMessage};
use crate::store::Cursor;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

// ── Archive client ──────────────────────────────────────────────────

/// One encrypted message as returned by the archive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatEnvelope {
    pub seq: i64,
    #[serde(default)]
    pub msgid: String,
    #[serde(default)]
    pub publickey_ver: u32,
    pub encrypt_random_key: String,
    pub encrypt_chat_msg: String,
}

/// One piece of a chunked media transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaChunk {
    pub data: Vec<u8>,
    /// Continuation token for the next request (meaningless once finished).
    pub next_token: String,
    pub finished: bool,
}

/// Access to the archive service.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Envelopes with sequence numbers above `seq`, at most `limit`.
    /// An empty vector means nothing new arrived within `timeout`.
    async fn fetch_batch(
        &self,
        seq: i64,
        limit: u32,
        timeout: Duration,
    ) -> Result<Vec<ChatEnvelope>, ChannelError>;

    /// One chunk of the attachment behind `file_handle`. Pass an empty
    /// token for the first chunk.
    async fn fetch_media_chunk(
        &self,
        token: &str,
        file_handle: &str,
    ) -> Result<MediaChunk, ChannelError>;
}

// ── Decryption ──────────────────────────────────────────────────────

/// Decrypts envelopes with the archive RSA private key.
pub struct EnvelopeDecryptor {
    key: RsaPrivateKey,
}

impl EnvelopeDecryptor {
    /// Load a PKCS#1 (`BEGIN RSA PRIVATE KEY`) or PKCS#8 PEM key.
    pub fn from_pem(pem: &str) -> Result<Self, DecryptError> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| DecryptError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Recover the message JSON from an envelope.
    pub fn decrypt(&self, envelope: &ChatEnvelope) -> Result<Value, DecryptError> {
        let wrapped_key = decode_base64("encrypt_random_key", &envelope.encrypt_random_key)?;
        let random_key = self
            .key
            .decrypt(Pkcs1v15Encrypt, &wrapped_key)
            .map_err(|e| DecryptError::Rsa(e.to_string()))?;
        let aes_key = derive_aes_key(&random_key)?;

        let ciphertext = decode_base64("encrypt_chat_msg", &envelope.encrypt_chat_msg)?;
        let plaintext = Aes256CbcDec::new_from_slices(&aes_key, &aes_key[..16])
            .map_err(|e| DecryptError::Payload(e.to_string()))?
            .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
            .map_err(|e| DecryptError::Payload(e.to_string()))?;
        let plaintext = strip_padding(&plaintext)?;

        Ok(serde_json::from_slice(plaintext)?)
    }
}

fn decode_base64(field: &'static str, value: &str) -> Result<Vec<u8>, DecryptError> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| DecryptError::Base64 {
            field,
            reason: e.to_string(),
        })
}

/// The decrypted random key is either the 32 raw key bytes or their
/// unpadded base64 form (43 chars).
fn derive_aes_key(random_key: &[u8]) -> Result<Vec<u8>, DecryptError> {
    match random_key.len() {
        32 => Ok(random_key.to_vec()),
        43 => {
            let mut padded = random_key.to_vec();
            padded.push(b'=');
            let key = STANDARD
                .decode(&padded)
                .map_err(|e| DecryptError::Base64 {
                    field: "random_key",
                    reason: e.to_string(),
                })?;
            if key.len() != 32 {
                return Err(DecryptError::KeyLength(key.len()));
            }
            Ok(key)
        }
        other => Err(DecryptError::KeyLength(other)),
    }
}

/// PKCS#7 unpadding that accepts pad lengths up to 32 (the archive pads to
/// 32-byte blocks; standard 16-byte padding is a subset).
fn strip_padding(data: &[u8]) -> Result<&[u8], DecryptError> {
    let Some(&last) = data.last() else {
        return Err(DecryptError::Payload("empty plaintext".into()));
    };
    let pad = usize::from(last);
    if pad == 0 || pad > 32 || pad > data.len() {
        return Err(DecryptError::Payload(format!("bad padding length {pad}")));
    }
    let (body, padding) = data.split_at(data.len() - pad);
    if padding.iter().any(|&b| b != last) {
        return Err(DecryptError::Payload("inconsistent padding bytes".into()));
    }
    Ok(body)
}

// ── Message bodies ──────────────────────────────────────────────────

/// What a decrypted archive message carries.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveBody {
    Text(String),
    Link(String),
    Media {
        kind: MessageType,
        file_handle: String,
        extension: String,
        original_name: Option<String>,
        /// The per-type JSON object, used as content if the download fails.
        descriptor: Value,
    },
    /// Media without a file handle; content is the descriptor JSON.
    MediaWithoutHandle { kind: MessageType, descriptor: Value },
    Unsupported(String),
}

/// Classify a decrypted message by `msgtype`.
pub fn classify_body(body: &Value) -> ArchiveBody {
    let msgtype = body
        .get("msgtype")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let section = body.get(msgtype).cloned().unwrap_or(Value::Null);
    let field = |name: &str| section.get(name).and_then(Value::as_str).map(str::to_string);

    match msgtype {
        "text" | "markdown" => ArchiveBody::Text(field("content").unwrap_or_default()),
        "link" => ArchiveBody::Link(field("link_url").unwrap_or_default()),
        "image" | "video" | "voice" | "file" => {
            let (kind, extension, original_name) = match msgtype {
                "image" => (MessageType::Image, "jpg".to_string(), None),
                "video" => (MessageType::Video, "mp4".to_string(), None),
                "voice" => (MessageType::File, "amr".to_string(), None),
                _ => (
                    MessageType::File,
                    field("fileext").unwrap_or_else(|| "bin".to_string()),
                    field("filename").filter(|n| !n.is_empty()),
                ),
            };
            match field("sdkfileid").filter(|h| !h.is_empty()) {
                Some(file_handle) => ArchiveBody::Media {
                    kind,
                    file_handle,
                    extension,
                    original_name,
                    descriptor: section.clone(),
                },
                None => ArchiveBody::MediaWithoutHandle {
                    kind,
                    descriptor: section.clone(),
                },
            }
        }
        other => ArchiveBody::Unsupported(other.to_string()),
    }
}

/// Sender of a decrypted message (`from`; `user` on switch events).
pub fn body_sender(body: &Value) -> Option<&str> {
    body.get("from")
        .or_else(|| body.get("user"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Creation time in seconds. The archive reports `msgtime` in
/// milliseconds; values that already look like seconds pass through.
pub fn body_time(body: &Value) -> i64 {
    let raw = body
        .get("msgtime")
        .or_else(|| body.get("time"))
        .and_then(Value::as_i64);
    match raw {
        Some(t) if t > 100_000_000_000 => t / 1000,
        Some(t) => t,
        None => chrono::Utc::now().timestamp(),
    }
}

// ── Poller ──────────────────────────────────────────────────────────

/// Poller settings.
#[derive(Debug, Clone)]
pub struct ArchivePollerConfig {
    /// Own identity; messages from it are skipped.
    pub self_user_id: Option<String>,
    pub batch_limit: u32,
    pub poll_timeout: Duration,
}

impl Default for ArchivePollerConfig {
    fn default() -> Self {
        Self {
            self_user_id: None,
            batch_limit: 100,
            poll_timeout: Duration::from_secs(20),
        }
    }
}

/// Pulls envelopes after the stored sequence and emits them.
pub struct ArchivePoller {
    client: Arc<dyn ArchiveClient>,
    decryptor: EnvelopeDecryptor,
    media: MediaRetriever,
    cursor: Cursor,
    sink: Arc<dyn MessageSink>,
    config: ArchivePollerConfig,
}

impl ArchivePoller {
    pub fn new(
        client: Arc<dyn ArchiveClient>,
        decryptor: EnvelopeDecryptor,
        media: MediaRetriever,
        cursor: Cursor,
        sink: Arc<dyn MessageSink>,
        config: ArchivePollerConfig,
    ) -> Self {
        Self {
            client,
            decryptor,
            media,
            cursor,
            sink,
            config,
        }
    }

    fn is_self(&self, sender: &str) -> bool {
        self.config
            .self_user_id
            .as_deref()
            .is_some_and(|id| !id.is_empty() && id == sender)
    }

    /// Build the unified message, downloading media when referenced.
    async fn normalize(&self, envelope: &ChatEnvelope, body: Value) -> Option<UnifiedMessage> {
        let msg_id = body
            .get("msgid")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(&envelope.msgid)
            .to_string();
        let Some(from) = body_sender(&body).map(str::to_string) else {
            warn!(seq = envelope.seq, "Archive message without sender, skipping");
            return None;
        };
        if msg_id.is_empty() {
            warn!(seq = envelope.seq, "Archive message without msgid, skipping");
            return None;
        }

        let (message_type, content) = match classify_body(&body) {
            ArchiveBody::Text(text) => (MessageType::Text, text),
            ArchiveBody::Link(url) => (MessageType::Link, url),
            ArchiveBody::Media {
                kind,
                file_handle,
                extension,
                original_name,
                descriptor,
            } => {
                let request = MediaRequest {
                    msg_id: &msg_id,
                    file_handle: &file_handle,
                    extension: &extension,
                    original_name: original_name.as_deref(),
                };
                match self.media.retrieve(&request).await {
                    Ok(path) => (kind, path.to_string_lossy().to_string()),
                    Err(e) => {
                        warn!(msg_id = %msg_id, "Media download failed, keeping descriptor: {e}");
                        (kind, descriptor.to_string())
                    }
                }
            }
            ArchiveBody::MediaWithoutHandle { kind, descriptor } => (kind, descriptor.to_string()),
            ArchiveBody::Unsupported(msgtype) => (
                MessageType::Text,
                format!("Unsupported message type: {msgtype}"),
            ),
        };

        let created_at = body_time(&body);
        Some(
            UnifiedMessage::new(
                Source::ChatArchive,
                msg_id,
                message_type,
                from,
                content,
                created_at,
            )
            .with_raw(body),
        )
    }
}

#[async_trait]
impl Poller for ArchivePoller {
    fn name(&self) -> &'static str {
        "chat-archive"
    }

    async fn poll_once(&mut self) -> Result<usize, ChannelError> {
        let seq = self.cursor.get_position().await;
        let batch = self
            .client
            .fetch_batch(seq, self.config.batch_limit, self.config.poll_timeout)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }

        // Every returned position is consumed: emitted, filtered, or
        // undecodable. None of them will be served again.
        let mut max_seq = seq;
        let mut emitted = 0;
        let mut filtered = 0;
        let mut failed = 0;

        for envelope in &batch {
            max_seq = max_seq.max(envelope.seq);

            let body = match self.decryptor.decrypt(envelope) {
                Ok(body) => body,
                Err(e) => {
                    failed += 1;
                    warn!(seq = envelope.seq, msgid = %envelope.msgid, "Envelope decrypt failed: {e}");
                    continue;
                }
            };

            if body_sender(&body).is_some_and(|from| self.is_self(from)) {
                filtered += 1;
                debug!(seq = envelope.seq, "Skipping self-sent archive message");
                continue;
            }

            match self.normalize(envelope, body).await {
                Some(message) => {
                    self.sink.submit(message).await;
                    emitted += 1;
                }
                None => failed += 1,
            }
        }

        self.cursor.set_position(max_seq).await;
        info!(
            from_seq = seq,
            to_seq = max_seq,
            emitted,
            filtered,
            failed,
            "Archive batch consumed"
        );
        Ok(emitted)
    }
}
