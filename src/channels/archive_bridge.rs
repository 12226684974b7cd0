//! HTTP client for the archive bridge.
//!
//! The archive SDK is a native library; a small bridge service owns it and
//! exposes its two calls as JSON endpoints:
//!
//! - `POST {base}/chatdata` `{seq, limit, timeout}` →
//!   `{errcode, errmsg, chatdata: [envelope, ...]}`
//! - `POST {base}/mediadata` `{sdkfileid, indexbuf, timeout}` →
//!   `{errcode, errmsg, data: <base64>, outindexbuf, is_finish}`

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::channels::archive::{ArchiveClient, ChatEnvelope, MediaChunk};
use crate::error::ChannelError;

const NAME: &str = "chat-archive";

/// Seconds the bridge may spend on one media chunk.
const MEDIA_CHUNK_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct ChatDataResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    chatdata: Vec<ChatEnvelope>,
}

#[derive(Debug, Deserialize)]
struct MediaDataResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    data: String,
    #[serde(default)]
    outindexbuf: String,
    #[serde(default)]
    is_finish: bool,
}

/// Archive client speaking JSON to the bridge.
pub struct ArchiveBridgeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl ArchiveBridgeClient {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, ChannelError> {
        let mut request = self
            .client
            .post(self.endpoint(path))
            .timeout(timeout)
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request.send().await.map_err(|e| ChannelError::Http {
            name: NAME.into(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChannelError::Http {
                name: NAME.into(),
                reason: format!("{path} returned {status}"),
            });
        }

        resp.json().await.map_err(|e| ChannelError::InvalidMessage(format!(
            "{path} response: {e}"
        )))
    }
}

#[async_trait]
impl ArchiveClient for ArchiveBridgeClient {
    async fn fetch_batch(
        &self,
        seq: i64,
        limit: u32,
        timeout: Duration,
    ) -> Result<Vec<ChatEnvelope>, ChannelError> {
        let body = json!({
            "seq": seq,
            "limit": limit,
            "timeout": timeout.as_secs(),
        });
        // The bridge long-polls for up to `timeout`; leave room for the reply.
        let data: ChatDataResponse = self
            .post("chatdata", body, timeout + Duration::from_secs(10))
            .await?;

        if data.errcode != 0 {
            return Err(ChannelError::Api {
                name: NAME.into(),
                code: data.errcode,
                message: data.errmsg,
            });
        }
        Ok(data.chatdata)
    }

    async fn fetch_media_chunk(
        &self,
        token: &str,
        file_handle: &str,
    ) -> Result<MediaChunk, ChannelError> {
        let body = json!({
            "sdkfileid": file_handle,
            "indexbuf": token,
            "timeout": MEDIA_CHUNK_TIMEOUT_SECS,
        });
        let data: MediaDataResponse = self
            .post(
                "mediadata",
                body,
                Duration::from_secs(MEDIA_CHUNK_TIMEOUT_SECS + 10),
            )
            .await?;

        if data.errcode != 0 {
            return Err(ChannelError::Api {
                name: NAME.into(),
                code: data.errcode,
                message: data.errmsg,
            });
        }

        let bytes = STANDARD
            .decode(data.data.as_bytes())
            .map_err(|e| ChannelError::InvalidMessage(format!("media chunk data: {e}")))?;
        Ok(MediaChunk {
            data: bytes,
            next_token: data.outindexbuf,
            finished: data.is_finish,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Json;
    use axum::Router;
    use axum::extract::State;
    use axum::routing::post;

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let client = ArchiveBridgeClient::new("http://bridge:8080/", None);
        assert_eq!(client.endpoint("chatdata"), "http://bridge:8080/chatdata");
    }

    #[tokio::test]
    async fn fetch_batch_parses_envelopes() {
        let router = Router::new().route(
            "/chatdata",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["seq"], 100);
                Json(json!({
                    "errcode": 0,
                    "errmsg": "ok",
                    "chatdata": [{
                        "seq": 101,
                        "msgid": "m101",
                        "publickey_ver": 2,
                        "encrypt_random_key": "a2V5",
                        "encrypt_chat_msg": "bXNn"
                    }]
                }))
            }),
        );
        let client = ArchiveBridgeClient::new(serve(router).await, None);

        let batch = client
            .fetch_batch(100, 100, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq, 101);
        assert_eq!(batch[0].publickey_ver, 2);
    }

    #[tokio::test]
    async fn fetch_batch_surfaces_api_errors() {
        let router = Router::new().route(
            "/chatdata",
            post(|| async { Json(json!({"errcode": 10001, "errmsg": "network error"})) }),
        );
        let client = ArchiveBridgeClient::new(serve(router).await, None);

        let err = client
            .fetch_batch(0, 100, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Api { code: 10001, .. }));
    }

    #[tokio::test]
    async fn media_chunks_follow_continuation_tokens() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/mediadata",
                post(
                    |State(calls): State<Arc<AtomicUsize>>,
                     Json(body): Json<serde_json::Value>| async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        let expected = if n == 0 { "" } else { "next-1" };
                        assert_eq!(body["indexbuf"], expected);
                        Json(json!({
                            "errcode": 0,
                            "data": STANDARD.encode(format!("chunk{n}")),
                            "outindexbuf": "next-1",
                            "is_finish": n == 1,
                        }))
                    },
                ),
            )
            .with_state(Arc::clone(&calls));
        let client = ArchiveBridgeClient::new(serve(router).await, None);

        let first = client.fetch_media_chunk("", "file-1").await.unwrap();
        assert_eq!(first.data, b"chunk0");
        assert!(!first.finished);
        let second = client
            .fetch_media_chunk(&first.next_token, "file-1")
            .await
            .unwrap();
        assert_eq!(second.data, b"chunk1");
        assert!(second.finished);
    }
}
