//! Error types for inbox-relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Decrypt error: {0}")]
    Decrypt(#[from] DecryptError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Source channel errors (archive bridge, bot API, IMAP).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("HTTP error on channel {name}: {reason}")]
    Http { name: String, reason: String },

    #[error("Channel {name} API error {code}: {message}")]
    Api {
        name: String,
        code: i64,
        message: String,
    },

    #[error("Channel {name} conflict: another consumer is active")]
    Conflict { name: String },

    #[error("IMAP error for {account}: {reason}")]
    Imap { account: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Channel {name} task failed: {reason}")]
    TaskFailed { name: String, reason: String },
}

impl ChannelError {
    /// Backoff to apply before the next poll, when the error calls for one
    /// other than the poller's standard cooldown.
    pub fn backoff_hint(&self) -> Option<Duration> {
        match self {
            Self::Conflict { .. } => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}

/// Envelope decryption errors. Always scoped to a single envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Base64 decode failed for {field}: {reason}")]
    Base64 { field: &'static str, reason: String },

    #[error("RSA decrypt failed: {0}")]
    Rsa(String),

    #[error("Symmetric key has unexpected length {0}")]
    KeyLength(usize),

    #[error("Payload decrypt failed: {0}")]
    Payload(String),

    #[error("Decrypted payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Media retrieval errors.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Chunk {index} fetch failed for {file_handle}: {reason}")]
    ChunkFailed {
        file_handle: String,
        index: usize,
        reason: String,
    },

    #[error("Media transfer for {file_handle} did not finish within {cap} chunks")]
    IterationCapExceeded { file_handle: String, cap: usize },

    #[error("Download failed: {0}")]
    Download(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handler action errors.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler {handler} failed: {reason}")]
    Failed {
        handler: &'static str,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// External collaborator errors (note API, LLM agents, object storage, notifier).
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{service} request failed: {reason}")]
    RequestFailed { service: &'static str, reason: String },

    #[error("{service} rejected the request with status {status}")]
    Rejected { service: &'static str, status: u16 },

    #[error("{service} returned an invalid response: {reason}")]
    InvalidResponse { service: &'static str, reason: String },

    #[error("{service} is not configured")]
    NotConfigured { service: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
