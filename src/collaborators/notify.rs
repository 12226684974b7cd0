//! Webhook notifier: posts `{"text": ...}` to an operator endpoint.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::collaborators::Notifier;
use crate::error::CollaboratorError;

const SERVICE: &str = "notify-webhook";

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, text: &str) -> Result<(), CollaboratorError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| CollaboratorError::RequestFailed {
                service: SERVICE,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(CollaboratorError::Rejected {
                service: SERVICE,
                status: resp.status().as_u16(),
            });
        }

        info!(chars = text.chars().count(), "Notification sent");
        Ok(())
    }
}
