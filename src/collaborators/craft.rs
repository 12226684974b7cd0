//! Craft-style note API client (`/links/{linkId}/api/v1/blocks`).

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::collaborators::{Block, NoteClient, NoteTarget};
use crate::error::CollaboratorError;

const SERVICE: &str = "note-api";

/// Default API base for multi-document links.
pub const DEFAULT_CRAFT_API_BASE: &str = "https://connect.craft.do/links";

/// HTTP client for the note API.
pub struct CraftClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl CraftClient {
    pub fn new(base_url: impl Into<String>, api_token: Option<SecretString>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        }
    }

    fn blocks_url(&self, link_id: &str) -> String {
        format!("{}/{link_id}/api/v1/blocks", self.base_url)
    }

    /// Pick the document token, falling back to the global API token.
    fn token_for(&self, target: &NoteTarget) -> Result<String, CollaboratorError> {
        target
            .token
            .clone()
            .or_else(|| self.api_token.as_ref().map(|t| t.expose_secret().to_string()))
            .ok_or(CollaboratorError::NotConfigured { service: SERVICE })
    }
}

#[async_trait]
impl NoteClient for CraftClient {
    async fn save_blocks(
        &self,
        blocks: &[Block],
        target: &NoteTarget,
    ) -> Result<bool, CollaboratorError> {
        let token = self.token_for(target)?;
        let body = serde_json::json!({
            "blocks": blocks,
            "position": {
                "position": "end",
                "pageId": target.document_id,
            }
        });

        debug!(
            link_id = %target.link_id,
            document_id = %target.document_id,
            count = blocks.len(),
            "Saving blocks"
        );

        let resp = self
            .client
            .post(self.blocks_url(&target.link_id))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| CollaboratorError::RequestFailed {
                service: SERVICE,
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CollaboratorError::Rejected {
                service: SERVICE,
                status: status.as_u16(),
            });
        }

        let text = resp.text().await.unwrap_or_default();
        let lowered = text.to_lowercase();
        if lowered.contains("deprecated") || lowered.contains("single document") {
            warn!("Note API link is deprecated; a multi-document link is required");
            return Ok(false);
        }

        if !matches!(status.as_u16(), 200 | 201) {
            warn!(status = status.as_u16(), body = %text.chars().take(200).collect::<String>(), "Note API refused blocks");
            return Ok(false);
        }

        info!(count = blocks.len(), document_id = %target.document_id, "Blocks saved");
        Ok(true)
    }

    async fn verify_access(&self, target: &NoteTarget) -> Result<String, CollaboratorError> {
        let token = self.token_for(target)?;
        let resp = self
            .client
            .get(self.blocks_url(&target.link_id))
            .bearer_auth(token)
            .query(&[
                ("id", target.document_id.as_str()),
                ("maxDepth", "-2"),
                ("fetchMetadata", "false"),
            ])
            .send()
            .await
            .map_err(|e| CollaboratorError::RequestFailed {
                service: SERVICE,
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.as_u16() != 200 {
            return Err(CollaboratorError::Rejected {
                service: SERVICE,
                status: status.as_u16(),
            });
        }

        let data: serde_json::Value = resp.json().await.unwrap_or_default();
        Ok(document_title(&data).unwrap_or_else(|| target.document_id.clone()))
    }
}

/// Pull a display title out of a document response.
fn document_title(data: &serde_json::Value) -> Option<String> {
    data.get("title")
        .or_else(|| data.get("name"))
        .or_else(|| data.get("content").and_then(|c| c.get("title")))
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}
