//! SHA-256 file hashing
//!
//! Files are read in 1MB chunks so large video and index files never have
//! to fit in memory.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::{Error, Result};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Lowercase hex SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Lowercase hex SHA-256 of a file (blocking)
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a file on the blocking pool so async callers stay responsive
pub async fn hash_file_async(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| Error::Internal(format!("Hash calculation task failed: {}", e)))?
}

/// Does the file at `path` exist with the expected hash?
///
/// A missing file is `Ok(false)`; comparison is case-insensitive.
pub fn file_matches(path: &Path, expected: &str) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    Ok(hash_file(path)?.eq_ignore_ascii_case(expected))
}
