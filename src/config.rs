//! Configuration types.
//!
//! Everything comes from environment variables. Each source has its own
//! `from_env()`; a source whose enabling variable is unset is disabled.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::email::EmailConfig;
use crate::collaborators::NoteTarget;
use crate::collaborators::craft::DEFAULT_CRAFT_API_BASE;
use crate::collaborators::llm::LlmConfig;
use crate::error::ConfigError;

/// Non-empty, trimmed value of an environment variable.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parsed value of an environment variable, or `default` when unset or invalid.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

// ── Chat archive ────────────────────────────────────────────────────

/// Chat-archive source configuration.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub bridge_url: String,
    pub bridge_token: Option<SecretString>,
    /// RSA private key (PEM) for the envelope keys.
    pub private_key_pem: SecretString,
    /// Bot identity whose own messages are skipped.
    pub self_user_id: Option<String>,
    pub batch_limit: u32,
    pub poll_timeout: Duration,
    pub cursor_floor: i64,
}

impl ArchiveConfig {
    /// `Ok(None)` when `WECOM_BRIDGE_URL` is unset (source disabled).
    /// A bridge without a private key is a configuration error.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(bridge_url) = env_opt("WECOM_BRIDGE_URL") else {
            return Ok(None);
        };

        let private_key_pem = match (env_opt("WECOM_PRIVATE_KEY"), env_opt("WECOM_PRIVATE_KEY_PATH")) {
            (Some(pem), _) => pem.replace("\\n", "\n"),
            (None, Some(path)) => std::fs::read_to_string(&path).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "WECOM_PRIVATE_KEY_PATH".into(),
                    message: format!("cannot read {path}: {e}"),
                }
            })?,
            (None, None) => {
                return Err(ConfigError::MissingRequired {
                    key: "WECOM_PRIVATE_KEY".into(),
                    hint: "Set WECOM_PRIVATE_KEY or WECOM_PRIVATE_KEY_PATH to the archive RSA key".into(),
                });
            }
        };

        Ok(Some(Self {
            bridge_url,
            bridge_token: env_opt("WECOM_BRIDGE_TOKEN").map(SecretString::from),
            private_key_pem: SecretString::from(private_key_pem),
            self_user_id: env_opt("WECOM_BOT_USERID"),
            batch_limit: env_parse("WECOM_BATCH_LIMIT", 100),
            poll_timeout: Duration::from_secs(env_parse("WECOM_POLL_TIMEOUT_SECS", 20)),
            cursor_floor: env_parse("WECOM_OFFSET_MAX", 0),
        }))
    }
}

// ── Bot API ─────────────────────────────────────────────────────────

/// Bot-API source configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub cursor_floor: i64,
    pub poll_timeout_secs: u64,
}

impl TelegramConfig {
    /// Returns `None` if `TELEGRAM_BOT_TOKEN` is not set (source disabled).
    pub fn from_env() -> Option<Self> {
        let bot_token = env_opt("TELEGRAM_BOT_TOKEN")?;
        Some(Self {
            bot_token: SecretString::from(bot_token),
            cursor_floor: env_parse("TELEGRAM_OFFSET_MAX", 0),
            poll_timeout_secs: env_parse("TELEGRAM_POLL_TIMEOUT_SECS", 20),
        })
    }
}

// ── Note API ────────────────────────────────────────────────────────

/// Note API endpoint and the inbox document for unbound senders.
#[derive(Debug, Clone)]
pub struct NotesConfig {
    pub api_base: String,
    pub api_token: Option<SecretString>,
    pub default_target: Option<NoteTarget>,
}

impl NotesConfig {
    pub fn from_env() -> Self {
        let default_target = match (env_opt("CRAFT_LINKS_ID"), env_opt("CRAFT_INBOX_PAGE_ID")) {
            (Some(link_id), Some(document_id)) => Some(NoteTarget {
                link_id,
                document_id,
                token: None,
            }),
            _ => None,
        };
        Self {
            api_base: env_opt("CRAFT_API_BASE").unwrap_or_else(|| DEFAULT_CRAFT_API_BASE.to_string()),
            api_token: env_opt("CRAFT_API_TOKEN").map(SecretString::from),
            default_target,
        }
    }
}

// ── Relay ───────────────────────────────────────────────────────────

/// Full relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub db_path: PathBuf,
    pub media_dir: PathBuf,
    /// Directory for daily-rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// Port for the health/status server; disabled when unset.
    pub status_port: Option<u16>,
    /// Sleep after a failed poll (jittered, never shorter than the poll interval).
    pub poller_cooldown: Duration,
    pub archive: Option<ArchiveConfig>,
    pub telegram: Option<TelegramConfig>,
    pub email: Option<EmailConfig>,
    pub notes: NotesConfig,
    pub media_upload_url: Option<String>,
    pub media_public_base_url: Option<String>,
    pub notification_url: Option<String>,
    pub llm: Option<LlmConfig>,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: env_opt("RELAY_DB_PATH")
                .unwrap_or_else(|| "./data/inbox-relay.db".to_string())
                .into(),
            media_dir: env_opt("RELAY_MEDIA_DIR")
                .unwrap_or_else(|| "./data/media".to_string())
                .into(),
            log_dir: env_opt("RELAY_LOG_DIR").map(PathBuf::from),
            status_port: env_opt("RELAY_STATUS_PORT").and_then(|p| p.parse().ok()),
            poller_cooldown: Duration::from_secs(env_parse("POLLER_ERROR_COOLDOWN_SECS", 15)),
            archive: ArchiveConfig::from_env()?,
            telegram: TelegramConfig::from_env(),
            email: EmailConfig::from_env(),
            notes: NotesConfig::from_env(),
            media_upload_url: env_opt("MEDIA_UPLOAD_URL"),
            media_public_base_url: env_opt("MEDIA_PUBLIC_BASE_URL"),
            notification_url: env_opt("RPA_NOTIFICATION_URL"),
            llm: LlmConfig::from_env(),
        })
    }

    /// Names of the enabled sources, for the startup banner.
    pub fn enabled_sources(&self) -> Vec<&'static str> {
        let mut sources = Vec::new();
        if self.archive.is_some() {
            sources.push("chat-archive");
        }
        if self.telegram.is_some() {
            sources.push("bot-api");
        }
        if self.email.is_some() {
            sources.push("email");
        }
        sources
    }
}
