//! Verified downloads with atomic rename
//!
//! Bytes are streamed into a hidden `.<name>.part` sibling of the final
//! path. Only after the transfer completes (and, when a hash is known, the
//! hash matches) is the temp file renamed into place, so a partially written
//! or corrupt file is never visible under its final name.

use std::future::Future;
use std::path::{Path, PathBuf};

use kiosk_common::hash::hash_file_async;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::retry::RetryPolicy;

/// Result of a completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the file now at the final path
    pub hash: String,
}

/// Temp path used while `dest` is being written
pub fn part_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.part", name))
}

/// Download into `dest` via `fetch`, verifying `expected_hash` if given
///
/// `fetch` writes the body into the path it is handed and returns the byte
/// count. Transient failures are retried per `policy`; a hash mismatch is
/// not retried and leaves `dest` untouched.
pub async fn download_verified<F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    dest: &Path,
    expected_hash: Option<&str>,
    mut fetch: F,
) -> Result<Downloaded>
where
    F: FnMut(PathBuf) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path_for(dest);

    let fetched = policy
        .run(label, |attempt| {
            debug!(artifact = label, attempt, "Downloading");
            let transfer = fetch(part.clone());
            let part = part.clone();
            async move {
                let result = transfer.await;
                if result.is_err() {
                    remove_quietly(&part).await;
                }
                result
            }
        })
        .await;

    let bytes = match fetched {
        Ok(bytes) => bytes,
        Err(e) => {
            remove_quietly(&part).await;
            return Err(e);
        }
    };

    let actual = match hash_file_async(part.clone()).await {
        Ok(hash) => hash,
        Err(e) => {
            remove_quietly(&part).await;
            return Err(e.into());
        }
    };

    if let Some(expected) = expected_hash {
        if !actual.eq_ignore_ascii_case(expected) {
            warn!(
                artifact = label,
                expected = %expected,
                actual = %actual,
                "Hash mismatch, discarding download"
            );
            remove_quietly(&part).await;
            return Err(AgentError::Integrity {
                artifact: label.to_string(),
                expected: expected.to_lowercase(),
                actual,
            });
        }
    }

    if let Err(e) = tokio::fs::rename(&part, dest).await {
        remove_quietly(&part).await;
        return Err(e.into());
    }

    Ok(Downloaded {
        bytes,
        hash: actual,
    })
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed temp file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
    }
}
