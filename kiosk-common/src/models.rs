//! Data model shared between the agent and its tooling
//!
//! Everything in here is received from (or sent to) the authority service,
//! or persisted to the config directory, so all types are serde-friendly.
//! Remote payloads are untrusted: call [`SyncManifest::validate`] and
//! [`RemoteDatabaseVersion::validate`] before acting on them.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Free-form metadata attached to playlist items and settings
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// One playable content item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub content_id: String,
    /// File name relative to the media directory
    pub filename: String,
    pub duration_seconds: f64,
    /// Lowercase hex SHA-256 of the file, when the authority publishes one
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Kind of event a trigger rule reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Demographic,
    Loyalty,
}

/// Predicate over an incoming trigger event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub kind: TriggerKind,
    #[serde(default)]
    pub age_min: Option<u32>,
    #[serde(default)]
    pub age_max: Option<u32>,
    /// `None` or `"any"` matches every gender
    #[serde(default)]
    pub gender: Option<String>,
    /// Loyalty rules only: restrict to one member
    #[serde(default)]
    pub member_id: Option<String>,
}

/// Playlist activated transiently when its rule matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredPlaylist {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub rule: TriggerRule,
    pub items: Vec<PlaylistItem>,
}

/// Versioned description of everything the device should play
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncManifest {
    pub playlist_version: u64,
    #[serde(default)]
    pub default_playlist: Vec<PlaylistItem>,
    #[serde(default)]
    pub triggered_playlists: Vec<TriggeredPlaylist>,
    #[serde(default)]
    pub settings: Metadata,
}

impl SyncManifest {
    /// Union of files referenced by the default and all triggered playlists,
    /// de-duplicated by filename (first occurrence wins)
    pub fn required_files(&self) -> Vec<ContentFile> {
        let mut seen = HashSet::new();
        self.default_playlist
            .iter()
            .chain(self.triggered_playlists.iter().flat_map(|p| p.items.iter()))
            .filter(|item| seen.insert(item.filename.clone()))
            .map(ContentFile::from)
            .collect()
    }

    /// Reject manifests that would be unsafe or ambiguous to apply
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for item in self.all_items() {
            validate_filename(&item.filename)?;
            if item.content_id.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "item '{}' has an empty content_id",
                    item.filename
                )));
            }
            if !item.duration_seconds.is_finite() || item.duration_seconds < 0.0 {
                return Err(Error::InvalidInput(format!(
                    "item '{}' has invalid duration {}",
                    item.filename, item.duration_seconds
                )));
            }
            if let Some(hash) = &item.file_hash {
                if !is_sha256_hex(hash) {
                    return Err(Error::InvalidInput(format!(
                        "item '{}' has malformed hash",
                        item.filename
                    )));
                }
            }
        }

        for playlist in &self.triggered_playlists {
            if !ids.insert(playlist.id.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate triggered playlist id '{}'",
                    playlist.id
                )));
            }
            if let (Some(min), Some(max)) = (playlist.rule.age_min, playlist.rule.age_max) {
                if min > max {
                    return Err(Error::InvalidInput(format!(
                        "triggered playlist '{}' has age_min {} > age_max {}",
                        playlist.id, min, max
                    )));
                }
            }
        }
        Ok(())
    }

    fn all_items(&self) -> impl Iterator<Item = &PlaylistItem> {
        self.default_playlist
            .iter()
            .chain(self.triggered_playlists.iter().flat_map(|p| p.items.iter()))
    }
}

/// A file the device must hold locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFile {
    pub content_id: String,
    pub filename: String,
    pub expected_hash: Option<String>,
}

impl From<&PlaylistItem> for ContentFile {
    fn from(item: &PlaylistItem) -> Self {
        Self {
            content_id: item.content_id.clone(),
            filename: item.filename.clone(),
            expected_hash: item.file_hash.as_ref().map(|h| h.to_lowercase()),
        }
    }
}

/// Which similarity database a record refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Safety,
    Loyalty,
}

impl DatabaseKind {
    pub const ALL: [DatabaseKind; 2] = [DatabaseKind::Safety, DatabaseKind::Loyalty];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Safety => "safety",
            DatabaseKind::Loyalty => "loyalty",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locally persisted record of the last verified database download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseVersion {
    pub database_kind: DatabaseKind,
    pub file_hash: String,
    pub version_token: String,
    pub last_updated: DateTime<Utc>,
}

/// Version descriptor published by the authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDatabaseVersion {
    pub file_hash: String,
    #[serde(default)]
    pub version_token: String,
}

impl RemoteDatabaseVersion {
    pub fn validate(&self) -> Result<()> {
        if !is_sha256_hex(&self.file_hash) {
            return Err(Error::InvalidInput(format!(
                "database version descriptor has malformed hash '{}'",
                self.file_hash
            )));
        }
        Ok(())
    }
}

/// Delivery status of a safety alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Forwarded,
}

/// Safety alert waiting to be forwarded
///
/// Never carries embeddings or captured images. `snapshot_ref` points to a
/// pre-encrypted blob and is only set when snapshots are explicitly enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAlert {
    pub alert_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub case_reference: String,
    pub confidence: f32,
    pub status: AlertStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
}

/// Debounced connectivity view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub online: bool,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_check_time: Option<DateTime<Utc>>,
}

/// Persisted pairing status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingStatus {
    pub paired: bool,
    #[serde(default)]
    pub paired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pairing_code: Option<String>,
}

/// Reject anything that is not a plain visible file name
pub fn validate_filename(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name == "..";
    if bad {
        return Err(Error::InvalidInput(format!("unsafe filename '{}'", name)));
    }
    Ok(())
}

/// True for a 64-character hex string (either case)
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, filename: &str) -> PlaylistItem {
        PlaylistItem {
            content_id: id.to_string(),
            filename: filename.to_string(),
            duration_seconds: 10.0,
            file_hash: None,
            metadata: Metadata::new(),
        }
    }

    fn rule() -> TriggerRule {
        TriggerRule {
            kind: TriggerKind::Demographic,
            age_min: Some(18),
            age_max: Some(35),
            gender: None,
            member_id: None,
        }
    }

    #[test]
    fn test_required_files_deduplicates_by_filename() {
        let manifest = SyncManifest {
            playlist_version: 1,
            default_playlist: vec![item("a", "a.mp4"), item("b", "b.mp4")],
            triggered_playlists: vec![TriggeredPlaylist {
                id: "t1".into(),
                name: None,
                rule: rule(),
                items: vec![item("b", "b.mp4"), item("c", "c.mp4")],
            }],
            settings: Metadata::new(),
        };

        let names: Vec<_> = manifest
            .required_files()
            .into_iter()
            .map(|f| f.filename)
            .collect();
        assert_eq!(names, vec!["a.mp4", "b.mp4", "c.mp4"]);
    }

    #[test]
    fn test_validate_rejects_path_traversal() {
        let manifest = SyncManifest {
            playlist_version: 1,
            default_playlist: vec![item("a", "../etc/passwd")],
            ..Default::default()
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_age_range() {
        let mut bad = rule();
        bad.age_min = Some(40);
        bad.age_max = Some(20);
        let manifest = SyncManifest {
            playlist_version: 1,
            triggered_playlists: vec![TriggeredPlaylist {
                id: "t1".into(),
                name: None,
                rule: bad,
                items: vec![],
            }],
            ..Default::default()
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_playlist_ids() {
        let playlist = TriggeredPlaylist {
            id: "dup".into(),
            name: None,
            rule: rule(),
            items: vec![],
        };
        let manifest = SyncManifest {
            playlist_version: 1,
            triggered_playlists: vec![playlist.clone(), playlist],
            ..Default::default()
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_manifest_parses_with_missing_optional_sections() {
        let manifest: SyncManifest =
            serde_json::from_str(r#"{"playlist_version": 3}"#).unwrap();
        assert_eq!(manifest.playlist_version, 3);
        assert!(manifest.default_playlist.is_empty());
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_remote_version_hash_validation() {
        let good = RemoteDatabaseVersion {
            file_hash: "a".repeat(64),
            version_token: "v1".into(),
        };
        assert!(good.validate().is_ok());

        let bad = RemoteDatabaseVersion {
            file_hash: "not-a-hash".into(),
            version_token: "v1".into(),
        };
        assert!(bad.validate().is_err());
    }
}
