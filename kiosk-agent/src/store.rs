//! Persisted local state
//!
//! One JSON file per concern inside the config directory. Each file has a
//! single writing component; every write goes through
//! [`kiosk_common::persist::write_json_atomic`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use kiosk_common::models::{
    DatabaseKind, DatabaseVersion, Metadata, PairingStatus, PendingAlert, SyncManifest,
};
use kiosk_common::persist::{self, read_json_or_default, write_json_atomic};
use tracing::{info, warn};

use crate::error::Result;

const DEVICE_ID_FILE: &str = "device_id";
const PAIRING_FILE: &str = "pairing.json";
const MANIFEST_FILE: &str = "manifest.json";
const SETTINGS_FILE: &str = "settings.json";
const DB_VERSIONS_FILE: &str = "database_versions.json";
const PENDING_ALERTS_FILE: &str = "pending_alerts.json";
const AUDIT_LOG_FILE: &str = "alert_audit.log";

/// Table of database version records, keyed by kind
pub type DatabaseVersionTable = BTreeMap<String, DatabaseVersion>;

/// File-backed store rooted at the config directory
pub struct LocalStore {
    root: PathBuf,
    /// Serializes read-modify-write of the version table across kinds
    db_versions_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            db_versions_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(AUDIT_LOG_FILE)
    }

    /// Device identifier: explicit value, else persisted, else generated
    pub fn resolve_device_id(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }

        let path = self.root.join(DEVICE_ID_FILE);
        if let Ok(existing) = std::fs::read_to_string(&path) {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(existing.to_string());
            }
        }

        let generated = uuid::Uuid::new_v4().to_string();
        persist::write_atomic(&path, generated.as_bytes())?;
        info!(device_id = %generated, "Generated new device identifier");
        Ok(generated)
    }

    pub fn load_pairing(&self) -> PairingStatus {
        read_json_or_default(&self.root.join(PAIRING_FILE))
    }

    pub fn save_pairing(&self, status: &PairingStatus) -> Result<()> {
        write_json_atomic(&self.root.join(PAIRING_FILE), status)?;
        Ok(())
    }

    /// Last applied manifest; `None` before the first successful sync
    pub fn load_manifest(&self) -> Option<SyncManifest> {
        match persist::read_json(&self.manifest_path()) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "Stored manifest unreadable, treating as absent");
                None
            }
        }
    }

    /// Persist a manifest and its settings block
    pub fn save_manifest(&self, manifest: &SyncManifest) -> Result<()> {
        write_json_atomic(&self.manifest_path(), manifest)?;
        write_json_atomic(&self.root.join(SETTINGS_FILE), &manifest.settings)?;
        Ok(())
    }

    pub fn load_settings(&self) -> Metadata {
        read_json_or_default(&self.root.join(SETTINGS_FILE))
    }

    pub fn load_db_versions(&self) -> DatabaseVersionTable {
        read_json_or_default(&self.root.join(DB_VERSIONS_FILE))
    }

    pub fn load_db_version(&self, kind: DatabaseKind) -> Option<DatabaseVersion> {
        self.load_db_versions().remove(kind.as_str())
    }

    /// Replace the record for one kind, leaving the others untouched
    pub fn save_db_version(&self, record: &DatabaseVersion) -> Result<()> {
        let _guard = self
            .db_versions_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut table = self.load_db_versions();
        table.insert(record.database_kind.as_str().to_string(), record.clone());
        write_json_atomic(&self.root.join(DB_VERSIONS_FILE), &table)?;
        Ok(())
    }

    pub fn load_pending_alerts(&self) -> Vec<PendingAlert> {
        read_json_or_default(&self.root.join(PENDING_ALERTS_FILE))
    }

    pub fn save_pending_alerts(&self, alerts: &[PendingAlert]) -> Result<()> {
        write_json_atomic(&self.root.join(PENDING_ALERTS_FILE), &alerts)?;
        Ok(())
    }

    /// Append one line to the forwarded-alert audit log
    pub fn append_audit(&self, line: &str) -> Result<()> {
        persist::append_line(&self.audit_log_path(), line)?;
        Ok(())
    }
}
