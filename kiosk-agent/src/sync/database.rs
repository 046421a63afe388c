//! Database sync pipeline
//!
//! Keeps the safety and loyalty similarity indexes current, each on its own
//! timer. A downloaded index is only recorded after its SHA-256 matches the
//! advertised hash; a mismatching download is deleted and the previous
//! version record stays authoritative.
//!
//! The index and its metadata are both staged under `.next` names and moved
//! into place together, then the version is recorded. A failure before the
//! commit leaves the previous pair untouched.
//!
//! Layout inside the data directory:
//!
//! ```text
//! databases/
//!   safety.index        safety.meta.json
//!   loyalty.index       loyalty.meta.json
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiosk_common::config::SyncConfig;
use kiosk_common::events::AgentEvent;
use kiosk_common::hash::hash_file_async;
use kiosk_common::models::{DatabaseKind, DatabaseVersion};
use kiosk_common::persist::write_json_atomic;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::download::download_verified;
use crate::authority::AuthorityClient;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{AgentError, Result};
use crate::retry::RetryPolicy;
use crate::state::SharedState;
use crate::store::LocalStore;

/// Outcome of one sync attempt for one kind
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseSyncOutcome {
    /// Authority has not published this database yet
    NotPublished,
    /// Device is offline; nothing attempted
    Offline,
    /// Local copy already matches the remote hash
    UpToDate,
    /// New verified copy recorded
    Updated(DatabaseVersion),
}

/// Verified on-disk artifacts for one database generation
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseArtifacts {
    pub kind: DatabaseKind,
    pub index_path: PathBuf,
    pub metadata_path: PathBuf,
    pub version: DatabaseVersion,
}

/// Per-kind status for the status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSyncStatus {
    pub kind: DatabaseKind,
    pub version_token: Option<String>,
    pub file_hash: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct KindHealth {
    last_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Periodic download of the similarity index databases
pub struct DatabaseSyncPipeline {
    client: Arc<AuthorityClient>,
    store: Arc<LocalStore>,
    connectivity: Option<Arc<ConnectivityMonitor>>,
    db_dir: PathBuf,
    policy: RetryPolicy,
    safety_interval: Duration,
    loyalty_interval: Duration,
    safety_wake: Notify,
    loyalty_wake: Notify,
    health: Mutex<HashMap<DatabaseKind, KindHealth>>,
    state: Option<Arc<SharedState>>,
}

impl DatabaseSyncPipeline {
    /// `data_dir` holds the `databases/` subdirectory
    pub fn new(
        client: Arc<AuthorityClient>,
        store: Arc<LocalStore>,
        data_dir: impl Into<PathBuf>,
        policy: RetryPolicy,
        config: &SyncConfig,
    ) -> Result<Self> {
        let db_dir = data_dir.into().join("databases");
        std::fs::create_dir_all(&db_dir)?;
        Ok(Self {
            client,
            store,
            connectivity: None,
            db_dir,
            policy,
            safety_interval: Duration::from_secs(config.safety_interval_secs.max(1)),
            loyalty_interval: Duration::from_secs(config.loyalty_interval_secs.max(1)),
            safety_wake: Notify::new(),
            loyalty_wake: Notify::new(),
            health: Mutex::new(HashMap::new()),
            state: None,
        })
    }

    pub fn with_connectivity(mut self, monitor: Arc<ConnectivityMonitor>) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    pub fn with_events(mut self, state: Arc<SharedState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn index_path(&self, kind: DatabaseKind) -> PathBuf {
        self.db_dir.join(format!("{}.index", kind))
    }

    pub fn metadata_path(&self, kind: DatabaseKind) -> PathBuf {
        self.db_dir.join(format!("{}.meta.json", kind))
    }

    pub fn interval(&self, kind: DatabaseKind) -> Duration {
        match kind {
            DatabaseKind::Safety => self.safety_interval,
            DatabaseKind::Loyalty => self.loyalty_interval,
        }
    }

    fn wake(&self, kind: DatabaseKind) -> &Notify {
        match kind {
            DatabaseKind::Safety => &self.safety_wake,
            DatabaseKind::Loyalty => &self.loyalty_wake,
        }
    }

    /// Request an immediate check from every per-kind loop
    ///
    /// A loop that is mid-cycle runs another cycle as soon as it finishes.
    pub fn sync_now(&self) {
        for kind in DatabaseKind::ALL {
            self.wake(kind).notify_one();
        }
    }

    /// Check one kind against the authority and download if needed
    pub async fn sync_kind(&self, kind: DatabaseKind) -> Result<DatabaseSyncOutcome> {
        if let Some(monitor) = &self.connectivity {
            if !monitor.is_online() {
                debug!(kind = %kind, "Offline, skipping database sync");
                return Ok(DatabaseSyncOutcome::Offline);
            }
        }

        let result = self.sync_kind_inner(kind).await;
        self.record(kind, &result);
        result
    }

    async fn sync_kind_inner(&self, kind: DatabaseKind) -> Result<DatabaseSyncOutcome> {
        let client = self.client.clone();
        let remote = self
            .policy
            .run("database_version", |_| {
                let client = client.clone();
                async move { client.fetch_database_version(kind).await }
            })
            .await?;
        let Some(remote) = remote else {
            debug!(kind = %kind, "Database not published yet");
            return Ok(DatabaseSyncOutcome::NotPublished);
        };

        let index_path = self.index_path(kind);
        let local = self.store.load_db_version(kind);
        let present = tokio::fs::try_exists(&index_path).await.unwrap_or(false);
        if let Some(local) = &local {
            if present && local.file_hash.eq_ignore_ascii_case(&remote.file_hash) {
                debug!(kind = %kind, version = %local.version_token, "Database up to date");
                return Ok(DatabaseSyncOutcome::UpToDate);
            }
        }

        info!(
            kind = %kind,
            from = ?local.as_ref().map(|v| v.version_token.as_str()),
            to = %remote.version_token,
            "Downloading database"
        );
        let client = self.client.clone();
        let label = format!("{}.index", kind);
        let staged_index = staged(&index_path);
        let done = download_verified(
            &self.policy,
            &label,
            &staged_index,
            Some(&remote.file_hash),
            |part| {
                let client = client.clone();
                async move { client.download_database(kind, &part).await }
            },
        )
        .await?;

        let metadata_path = self.metadata_path(kind);
        let staged_metadata = staged(&metadata_path);
        let records = self.fetch_metadata(kind).await;
        if let Err(e) = write_json_atomic(&staged_metadata, &records) {
            remove_quietly(&staged_index).await;
            return Err(e.into());
        }

        // Commit: index and metadata move together, then the record
        if let Err(e) = tokio::fs::rename(&staged_index, &index_path).await {
            remove_quietly(&staged_index).await;
            remove_quietly(&staged_metadata).await;
            return Err(e.into());
        }
        tokio::fs::rename(&staged_metadata, &metadata_path).await?;

        let record = DatabaseVersion {
            database_kind: kind,
            file_hash: done.hash,
            version_token: remote.version_token,
            last_updated: Utc::now(),
        };
        self.store.save_db_version(&record)?;
        info!(kind = %kind, version = %record.version_token, bytes = done.bytes, "Database updated");

        if let Some(state) = &self.state {
            state.broadcast_event(AgentEvent::DatabaseUpdated {
                kind,
                version_token: record.version_token.clone(),
                timestamp: record.last_updated,
            });
        }
        Ok(DatabaseSyncOutcome::Updated(record))
    }

    /// Record metadata, or an empty set when none is exposed
    async fn fetch_metadata(&self, kind: DatabaseKind) -> Vec<serde_json::Value> {
        let client = self.client.clone();
        let fetched = self
            .policy
            .run("database_metadata", |_| {
                let client = client.clone();
                async move { client.fetch_database_metadata(kind).await }
            })
            .await;

        match fetched {
            Ok(Some(records)) => records,
            Ok(None) => {
                debug!(kind = %kind, "No metadata endpoint, using empty metadata");
                Vec::new()
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Metadata fetch failed, using empty metadata");
                Vec::new()
            }
        }
    }

    fn record(&self, kind: DatabaseKind, result: &Result<DatabaseSyncOutcome>) {
        let mut health = self.lock_health();
        let entry = health.entry(kind).or_default();
        entry.last_check = Some(Utc::now());
        match result {
            Ok(_) => {
                entry.consecutive_failures = 0;
                entry.last_error = None;
            }
            Err(e) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.last_error = Some(e.to_string());
                warn!(kind = %kind, error = %e, "Database sync failed");
                if let Some(state) = &self.state {
                    state.broadcast_event(AgentEvent::DatabaseSyncFailed {
                        kind,
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    /// Verified artifacts for the recorded version of `kind`
    ///
    /// Called by a match database that saw its backing file change. Returns
    /// `None` when nothing has been recorded yet, and an integrity error when
    /// the file on disk does not match the record.
    pub async fn reload(&self, kind: DatabaseKind) -> Result<Option<DatabaseArtifacts>> {
        let Some(version) = self.store.load_db_version(kind) else {
            return Ok(None);
        };
        let index_path = self.index_path(kind);
        if !tokio::fs::try_exists(&index_path).await.unwrap_or(false) {
            return Ok(None);
        }

        let actual = hash_file_async(index_path.clone()).await?;
        if !actual.eq_ignore_ascii_case(&version.file_hash) {
            return Err(AgentError::Integrity {
                artifact: format!("{}.index", kind),
                expected: version.file_hash,
                actual,
            });
        }

        let metadata_path = self.metadata_path(kind);
        if !tokio::fs::try_exists(&metadata_path).await.unwrap_or(false) {
            write_json_atomic(&metadata_path, &Vec::<serde_json::Value>::new())?;
        }

        Ok(Some(DatabaseArtifacts {
            kind,
            index_path,
            metadata_path,
            version,
        }))
    }

    pub fn status(&self) -> Vec<DatabaseSyncStatus> {
        let versions = self.store.load_db_versions();
        let health = self.lock_health();
        DatabaseKind::ALL
            .iter()
            .map(|kind| {
                let version = versions.get(kind.as_str());
                let h = health.get(kind).cloned().unwrap_or_default();
                DatabaseSyncStatus {
                    kind: *kind,
                    version_token: version.map(|v| v.version_token.clone()),
                    file_hash: version.map(|v| v.file_hash.clone()),
                    last_updated: version.map(|v| v.last_updated),
                    last_check: h.last_check,
                    consecutive_failures: h.consecutive_failures,
                    last_error: h.last_error,
                }
            })
            .collect()
    }

    /// One timer loop per kind, until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Database sync loops started");
        tokio::join!(
            self.run_kind(DatabaseKind::Safety, cancel.clone()),
            self.run_kind(DatabaseKind::Loyalty, cancel.clone()),
        );
        info!("Database sync loops stopped");
    }

    async fn run_kind(&self, kind: DatabaseKind, cancel: CancellationToken) {
        let interval = self.interval(kind);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.sync_kind(kind) => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake(kind).notified() => debug!(kind = %kind, "Database sync requested"),
            }
        }
    }

    fn lock_health(&self) -> MutexGuard<'_, HashMap<DatabaseKind, KindHealth>> {
        self.health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Staging name next to `path` for a not yet committed artifact
pub fn staged(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".next");
    PathBuf::from(name)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove staged file");
        }
    }
}
