//! Chunked media retrieval for the chat archive.
//!
//! The archive hands out large attachments piecewise: the first request
//! carries an empty continuation token, each reply carries a data chunk,
//! a `finished` flag and the token for the next request. Chunks are
//! streamed into a temporary file that is renamed into place only once the
//! transfer finishes, so callers get either a complete file or an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::channels::archive::ArchiveClient;
use crate::error::MediaError;

/// Upper bound on chunk requests for one file.
pub const MEDIA_ITERATION_CAP: usize = 100;

/// Longest sanitized original file name kept in the local name.
const MAX_SAFE_NAME_CHARS: usize = 100;

/// What to download and how to name it.
#[derive(Debug, Clone)]
pub struct MediaRequest<'a> {
    pub msg_id: &'a str,
    /// Opaque archive handle (`sdkfileid`).
    pub file_handle: &'a str,
    /// Extension used when there is no original file name.
    pub extension: &'a str,
    pub original_name: Option<&'a str>,
}

/// Downloads archive media into a local directory.
pub struct MediaRetriever {
    client: Arc<dyn ArchiveClient>,
    dir: PathBuf,
    cap: usize,
}

impl MediaRetriever {
    pub fn new(client: Arc<dyn ArchiveClient>, dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            dir: dir.into(),
            cap: MEDIA_ITERATION_CAP,
        }
    }

    /// Override the chunk cap.
    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetch every chunk of `request.file_handle` and return the local path.
    ///
    /// A file already present under the derived name is reused without
    /// contacting the archive.
    pub async fn retrieve(&self, request: &MediaRequest<'_>) -> Result<PathBuf, MediaError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let name = media_file_name(
            request.msg_id,
            request.file_handle,
            request.extension,
            request.original_name,
        );
        let final_path = self.dir.join(&name);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            debug!(path = %final_path.display(), "Media already downloaded");
            return Ok(final_path);
        }

        let temp_path = temp_path_for(&self.dir, &name);
        match self.download_into(request.file_handle, &temp_path).await {
            Ok(size) => {
                tokio::fs::rename(&temp_path, &final_path).await.inspect_err(|_| {
                    remove_quietly(&temp_path);
                })?;
                info!(path = %final_path.display(), size, "Media downloaded");
                Ok(final_path)
            }
            Err(e) => {
                remove_quietly(&temp_path);
                warn!(file_handle = %short(request.file_handle), "Media retrieval failed: {e}");
                Err(e)
            }
        }
    }

    /// Stream chunks into `temp_path`; returns the byte count.
    async fn download_into(&self, file_handle: &str, temp_path: &Path) -> Result<u64, MediaError> {
        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut token = String::new();
        let mut total: u64 = 0;

        for index in 0..self.cap {
            let chunk = self
                .client
                .fetch_media_chunk(&token, file_handle)
                .await
                .map_err(|e| MediaError::ChunkFailed {
                    file_handle: short(file_handle).to_string(),
                    index,
                    reason: e.to_string(),
                })?;

            file.write_all(&chunk.data).await?;
            total += chunk.data.len() as u64;

            if chunk.finished {
                file.flush().await?;
                file.sync_all().await?;
                debug!(chunks = index + 1, bytes = total, "Media transfer finished");
                return Ok(total);
            }
            token = chunk.next_token;
        }

        Err(MediaError::IterationCapExceeded {
            file_handle: short(file_handle).to_string(),
            cap: self.cap,
        })
    }
}

// ── File naming ─────────────────────────────────────────────────────

/// `media_<msgid>_<hash8>` plus `_<safe original name>` or `.<ext>`.
///
/// `hash8` is the first 8 hex digits of SHA-256 over the file handle, so
/// the same attachment always maps to the same name.
pub fn media_file_name(
    msg_id: &str,
    file_handle: &str,
    extension: &str,
    original_name: Option<&str>,
) -> String {
    let digest = hex::encode(Sha256::digest(file_handle.as_bytes()));
    let msg_part: String = msg_id
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    let base = format!("media_{msg_part}_{}", &digest[..8]);

    let safe = original_name.map(sanitize_file_name).unwrap_or_default();
    if safe.is_empty() {
        let ext: String = extension
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        let ext = if ext.is_empty() { "bin".to_string() } else { ext };
        format!("{base}.{ext}")
    } else {
        format!("{base}_{safe}")
    }
}

/// Keep alphanumerics, spaces, dots, underscores and dashes; cap the stem
/// length while preserving the extension.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();

    if cleaned.chars().count() <= MAX_SAFE_NAME_CHARS {
        return cleaned;
    }
    match cleaned.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let stem: String = stem.chars().take(MAX_SAFE_NAME_CHARS).collect();
            format!("{stem}.{ext}")
        }
        _ => cleaned.chars().take(MAX_SAFE_NAME_CHARS).collect(),
    }
}

// ── Atomic writes ───────────────────────────────────────────────────

/// Write `bytes` to `dir/name` through a temporary file and a rename.
pub async fn write_atomically(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, MediaError> {
    tokio::fs::create_dir_all(dir).await?;
    let final_path = dir.join(name);
    let temp_path = temp_path_for(dir, name);

    let result = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &final_path).await
    }
    .await;

    if let Err(e) = result {
        remove_quietly(&temp_path);
        return Err(MediaError::Io(e));
    }
    Ok(final_path)
}

fn temp_path_for(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!(".{name}.{}.part", uuid::Uuid::new_v4().simple()))
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), "Failed to remove temporary file: {e}");
    }
}

/// File handles are long; logs only need the start.
fn short(file_handle: &str) -> &str {
    match file_handle.char_indices().nth(30) {
        Some((idx, _)) => &file_handle[..idx],
        None => file_handle,
    }
}
