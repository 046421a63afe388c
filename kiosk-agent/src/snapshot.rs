//! Encrypted alert snapshots
//!
//! Only used when `[alerts] snapshot_dir` is configured. Snapshot bytes are
//! sealed with AES-256-GCM under a per-device key before anything touches
//! the disk; the alert carries only the sealed file's path.
//!
//! Sealed blob layout: 12-byte nonce followed by ciphertext + tag.

use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use kiosk_common::persist::write_atomic;
use rand::RngCore;
use tracing::info;
use uuid::Uuid;

use crate::error::{AgentError, Result};

const KEY_FILE: &str = "snapshot.key";
const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12; // 96 bits for GCM

/// Seals snapshots into the configured directory
pub struct SnapshotSealer {
    dir: PathBuf,
    cipher: Aes256Gcm,
}

impl SnapshotSealer {
    /// Open (or create) the device key in `key_dir` and the output directory
    pub fn open(dir: impl Into<PathBuf>, key_dir: &Path) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let key = load_or_create_key(&key_dir.join(KEY_FILE))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| AgentError::Internal(format!("Cipher initialization failed: {}", e)))?;
        Ok(Self { dir, cipher })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Encrypt `plaintext` and write it as `<alert_id>.snap`
    pub fn seal(&self, alert_id: Uuid, plaintext: &[u8]) -> Result<PathBuf> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| AgentError::Internal(format!("Encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        let path = self.dir.join(format!("{}.snap", alert_id));
        write_atomic(&path, &blob)?;
        Ok(path)
    }

    /// Decrypt a blob written by [`Self::seal`]
    pub fn unseal(&self, path: &Path) -> Result<Vec<u8>> {
        let blob = std::fs::read(path)?;
        if blob.len() < NONCE_SIZE {
            return Err(AgentError::InvalidPayload("sealed snapshot truncated".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| AgentError::InvalidPayload(format!("Decryption failed: {}", e)))
    }
}

fn load_or_create_key(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(key) if key.len() == KEY_SIZE => return Ok(key),
        Ok(key) => {
            return Err(AgentError::Config(format!(
                "{} holds {} bytes, expected {}",
                path.display(),
                key.len(),
                KEY_SIZE
            )))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut key = vec![0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    write_atomic(path, &key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!(path = %path.display(), "Generated snapshot key");
    Ok(key)
}
