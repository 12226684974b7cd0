//! Object storage upload over HTTP multipart.
//!
//! The endpoint receives a `file` part and answers `{"url": "..."}`. When
//! it answers without a URL, the public base URL plus the file name is used.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::info;

use crate::collaborators::ObjectStorage;
use crate::error::CollaboratorError;

const SERVICE: &str = "object-storage";

pub struct HttpObjectStorage {
    client: reqwest::Client,
    upload_url: String,
    public_base_url: Option<String>,
}

impl HttpObjectStorage {
    pub fn new(upload_url: impl Into<String>, public_base_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            upload_url: upload_url.into(),
            public_base_url: public_base_url.map(|b| b.trim_end_matches('/').to_string()),
        }
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload(&self, path: &Path) -> Result<Option<String>, CollaboratorError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let bytes = tokio::fs::read(path).await?;
        let size = bytes.len();
        let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name.clone()));

        let resp = self
            .client
            .post(&self.upload_url)
            .multipart(form)
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

        let data: serde_json::Value = resp.json().await.unwrap_or_default();
        let url = data
            .get("url")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                self.public_base_url
                    .as_ref()
                    .map(|base| format!("{base}/{file_name}"))
            });

        info!(file = %file_name, size, url = ?url, "Uploaded media");
        Ok(url)
    }
}
