//! LLM agents for email summaries and text classification.
//!
//! Uses rig-core agents (Anthropic or OpenAI). Both agents answer in JSON;
//! the parsers here tolerate markdown fences and surrounding prose.

use std::sync::Arc;

use async_trait::async_trait;
use rig::agent::{Agent, AgentBuilder};
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use secrecy::{ExposeSecret, SecretString};

use crate::collaborators::{Classifier, Decision, Summarizer, Summary};
use crate::error::CollaboratorError;

const SERVICE: &str = "llm";

/// Max tokens per agent reply.
const AGENT_MAX_TOKENS: u64 = 1024;

/// Longest body passed to the summarizer.
const SUMMARY_INPUT_CHARS: usize = 4000;

const SUMMARY_PREAMBLE: &str = "You summarize emails for a busy reader. \
Respond with a single JSON object and nothing else: \
{\"summary\": string (<= 3 sentences), \"importance\": \"high\" | \"medium\" | \"low\", \
\"action_items\": [string]}.";

const CLASSIFY_PREAMBLE: &str = "You triage short chat messages. Decide whether the message \
is a question the user wants answered, or a note they want to keep. \
Respond with a single JSON object and nothing else: \
{\"is_question\": bool, \"reply\": string (answer when is_question, else empty), \
\"title\": string (short title when it is a note, else empty)}.";

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

/// Configuration for the agents.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    /// Build config from environment variables.
    /// Returns `None` if `LLM_API_KEY` is not set (agents disabled).
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("LLM_API_KEY").ok()?;
        let backend = match std::env::var("LLM_BACKEND")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "openai" => LlmBackend::OpenAi,
            _ => LlmBackend::Anthropic,
        };
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| match backend {
            LlmBackend::Anthropic => "claude-sonnet-4-20250514".to_string(),
            LlmBackend::OpenAi => "gpt-4o-mini".to_string(),
        });
        Some(Self {
            backend,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

/// Summarizer + classifier handles sharing one model.
#[derive(Clone)]
pub struct LlmAgents {
    pub summarizer: Arc<dyn Summarizer>,
    pub classifier: Arc<dyn Classifier>,
}

impl LlmAgents {
    /// Create both agents from configuration.
    ///
    /// Must be called from inside a tokio runtime: building a rig agent
    /// spawns its tool server task.
    pub fn create(config: &LlmConfig) -> Result<Self, CollaboratorError> {
        match config.backend {
            LlmBackend::Anthropic => {
                use rig::providers::anthropic;

                let client: rig::client::Client<anthropic::client::AnthropicExt> =
                    anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
                        CollaboratorError::RequestFailed {
                            service: SERVICE,
                            reason: format!("Failed to create Anthropic client: {e}"),
                        }
                    })?;
                tracing::info!("Using Anthropic agents (model: {})", config.model);
                Ok(Self::from_model(client.completion_model(&config.model)))
            }
            LlmBackend::OpenAi => {
                use rig::providers::openai;

                let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                    openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
                        CollaboratorError::RequestFailed {
                            service: SERVICE,
                            reason: format!("Failed to create OpenAI client: {e}"),
                        }
                    })?;
                tracing::info!("Using OpenAI agents (model: {})", config.model);
                Ok(Self::from_model(client.completion_model(&config.model)))
            }
        }
    }

    fn from_model<M>(model: M) -> Self
    where
        M: CompletionModel + 'static,
    {
        let agents = Arc::new(RigAgents {
            summary: AgentBuilder::new(model.clone())
                .preamble(SUMMARY_PREAMBLE)
                .max_tokens(AGENT_MAX_TOKENS)
                .build(),
            classify: AgentBuilder::new(model)
                .preamble(CLASSIFY_PREAMBLE)
                .max_tokens(AGENT_MAX_TOKENS)
                .build(),
        });
        Self {
            summarizer: agents.clone(),
            classifier: agents,
        }
    }
}

/// rig-backed agents.
struct RigAgents<M: CompletionModel> {
    summary: Agent<M>,
    classify: Agent<M>,
}

#[async_trait]
impl<M> Summarizer for RigAgents<M>
where
    M: CompletionModel + 'static,
{
    async fn summarize(
        &self,
        subject: &str,
        body: &str,
    ) -> Result<Option<Summary>, CollaboratorError> {
        let body: String = body.chars().take(SUMMARY_INPUT_CHARS).collect();
        if body.trim().is_empty() {
            return Ok(None);
        }
        let prompt = format!("Subject: {subject}\n\n{body}");
        let raw = self
            .summary
            .prompt(prompt)
            .await
            .map_err(|e| CollaboratorError::RequestFailed {
                service: SERVICE,
                reason: e.to_string(),
            })?;
        parse_summary(&raw).map(Some)
    }
}

#[async_trait]
impl<M> Classifier for RigAgents<M>
where
    M: CompletionModel + 'static,
{
    async fn classify(&self, text: &str) -> Result<Decision, CollaboratorError> {
        let raw = self
            .classify
            .prompt(text.to_string())
            .await
            .map_err(|e| CollaboratorError::RequestFailed {
                service: SERVICE,
                reason: e.to_string(),
            })?;
        parse_decision(&raw)
    }
}

// ── Response parsing ────────────────────────────────────────────────

/// Classifier response structure.
#[derive(Debug, serde::Deserialize)]
struct DecisionResponse {
    #[serde(default)]
    is_question: bool,
    #[serde(default)]
    reply: String,
    #[serde(default)]
    title: String,
}

/// Parse the summarizer's JSON reply.
pub fn parse_summary(raw: &str) -> Result<Summary, CollaboratorError> {
    let json_str = extract_json_object(raw);
    let summary: Summary =
        serde_json::from_str(&json_str).map_err(|e| CollaboratorError::InvalidResponse {
            service: SERVICE,
            reason: format!("JSON parse error: {e}"),
        })?;
    if summary.summary.trim().is_empty() {
        return Err(CollaboratorError::InvalidResponse {
            service: SERVICE,
            reason: "empty summary".into(),
        });
    }
    Ok(summary)
}

/// Parse the classifier's JSON reply.
pub fn parse_decision(raw: &str) -> Result<Decision, CollaboratorError> {
    let json_str = extract_json_object(raw);
    let response: DecisionResponse =
        serde_json::from_str(&json_str).map_err(|e| CollaboratorError::InvalidResponse {
            service: SERVICE,
            reason: format!("JSON parse error: {e}"),
        })?;

    let non_empty = |s: String| {
        let trimmed = s.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    Ok(Decision {
        is_question: response.is_question,
        reply: non_empty(response.reply),
        saved_title: non_empty(response.title),
    })
}

/// Extract a JSON object from an LLM reply (raw, fenced, or embedded).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
