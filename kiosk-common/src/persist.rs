//! Atomic JSON persistence
//!
//! Every state file is written to a hidden sibling first, flushed to disk and
//! renamed over the target, so a power cut leaves either the old or the new
//! contents and never a torn file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::{Error, Result};

/// Hidden temporary sibling used while writing `path`
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Write bytes atomically (write temp, fsync, rename)
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_path_for(path);
    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Read JSON from `path`; `Ok(None)` when the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Read JSON, falling back to `T::default()` when missing or unreadable
///
/// Corrupt state is logged and ignored so the agent keeps running.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match read_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable state file");
            T::default()
        }
    }
}

/// Append one line to an append-only log file
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        version: u64,
        names: Vec<String>,
    }

    #[test]
    fn test_write_then_read_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let sample = Sample {
            version: 7,
            names: vec!["a".into()],
        };

        write_json_atomic(&path, &sample).unwrap();
        let loaded: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, sample);
        assert!(!temp_path_for(&path).exists(), "temp file must be renamed away");
    }

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Sample> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();

        let loaded: Sample = read_json_or_default(&path);
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_append_line_accumulates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.log");
        append_line(&path, "one").unwrap();
        append_line(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let tmp = temp_path_for(Path::new("/var/lib/kiosk/manifest.json"));
        assert_eq!(tmp, PathBuf::from("/var/lib/kiosk/.manifest.json.tmp"));
    }
}
