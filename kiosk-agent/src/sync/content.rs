//! Content sync pipeline
//!
//! Keeps the media directory and the stored manifest consistent with the
//! authority. A cycle either applies a complete, version-checked manifest or
//! changes nothing; individual file failures are counted but never abort the
//! rest of the cycle.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiosk_common::events::AgentEvent;
use kiosk_common::hash::hash_file_async;
use kiosk_common::models::{ContentFile, SyncManifest};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::download::download_verified;
use crate::authority::AuthorityClient;
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::state::SharedState;
use crate::store::LocalStore;

/// Invoked after every cycle with its success flag
pub type SyncCompleteObserver = Box<dyn Fn(bool) + Send + Sync>;
/// Invoked with the effective manifest when new content was applied
pub type ContentUpdatedObserver = Box<dyn Fn(&SyncManifest) + Send + Sync>;

/// What one cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub success: bool,
    /// Skipped because the device is offline
    pub skipped: bool,
    /// A newer manifest was persisted
    pub manifest_applied: bool,
    pub playlist_version: Option<u64>,
    pub downloaded: Vec<String>,
    pub failed: Vec<String>,
    pub error: Option<String>,
}

impl SyncReport {
    pub fn content_updated(&self) -> bool {
        self.manifest_applied || !self.downloaded.is_empty()
    }
}

/// Counters exposed in the status snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContentSyncStats {
    pub consecutive_failures: u32,
    pub total_cycles: u64,
    pub total_failures: u64,
    pub files_downloaded: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Periodic manifest + media synchronisation
pub struct ContentSyncPipeline {
    client: Arc<AuthorityClient>,
    store: Arc<LocalStore>,
    connectivity: Option<Arc<ConnectivityMonitor>>,
    media_dir: PathBuf,
    policy: RetryPolicy,
    interval: Duration,
    wake: Notify,
    cycle_lock: tokio::sync::Mutex<()>,
    stats: Mutex<ContentSyncStats>,
    on_complete: RwLock<Vec<SyncCompleteObserver>>,
    on_updated: RwLock<Vec<ContentUpdatedObserver>>,
    state: Option<Arc<SharedState>>,
}

impl ContentSyncPipeline {
    pub fn new(
        client: Arc<AuthorityClient>,
        store: Arc<LocalStore>,
        media_dir: impl Into<PathBuf>,
        policy: RetryPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            connectivity: None,
            media_dir: media_dir.into(),
            policy,
            interval,
            wake: Notify::new(),
            cycle_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(ContentSyncStats::default()),
            on_complete: RwLock::new(Vec::new()),
            on_updated: RwLock::new(Vec::new()),
            state: None,
        }
    }

    /// Skip cycles while `monitor` reports offline
    pub fn with_connectivity(mut self, monitor: Arc<ConnectivityMonitor>) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    pub fn with_events(mut self, state: Arc<SharedState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    pub fn on_sync_complete(&self, observer: SyncCompleteObserver) {
        self.on_complete
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    pub fn on_content_updated(&self, observer: ContentUpdatedObserver) {
        self.on_updated
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    pub fn stats(&self) -> ContentSyncStats {
        self.lock_stats().clone()
    }

    /// Wake the background loop for an immediate cycle
    pub fn sync_now(&self) {
        self.wake.notify_one();
    }

    /// Run one full cycle; cycles never overlap
    pub async fn run_cycle(&self) -> SyncReport {
        let _cycle = self.cycle_lock.lock().await;

        if let Some(monitor) = &self.connectivity {
            if !monitor.is_online() {
                debug!("Offline, skipping content sync");
                let report = SyncReport {
                    skipped: true,
                    ..Default::default()
                };
                self.finish(&report, None);
                return report;
            }
        }

        let report_and_manifest = self.sync_once().await;
        let (report, manifest) = match report_and_manifest {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "Content sync failed, keeping local state");
                (
                    SyncReport {
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                    None,
                )
            }
        };

        self.record(&report);
        self.finish(&report, manifest.as_ref());
        report
    }

    async fn sync_once(&self) -> Result<(SyncReport, Option<SyncManifest>)> {
        let client = self.client.clone();
        let remote = self
            .policy
            .run("fetch_manifest", |_| {
                let client = client.clone();
                async move { client.fetch_manifest().await }
            })
            .await?;

        let mut report = SyncReport::default();
        let manifest = match self.store.load_manifest() {
            Some(local) if remote.playlist_version <= local.playlist_version => {
                debug!(
                    remote = remote.playlist_version,
                    local = local.playlist_version,
                    "Manifest not newer, nothing to apply"
                );
                local
            }
            local => {
                self.store.save_manifest(&remote)?;
                info!(
                    from = ?local.map(|m| m.playlist_version),
                    to = remote.playlist_version,
                    "Applied new manifest"
                );
                report.manifest_applied = true;
                remote
            }
        };
        report.playlist_version = Some(manifest.playlist_version);

        for file in manifest.required_files() {
            match self.ensure_file(&file).await {
                Ok(true) => report.downloaded.push(file.filename.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(filename = %file.filename, error = %e, "Content file not synced");
                    report.failed.push(file.filename.clone());
                }
            }
        }

        report.success = report.failed.is_empty();
        if !report.success {
            report.error = Some(format!("{} file(s) failed", report.failed.len()));
        }
        Ok((report, Some(manifest)))
    }

    /// Make sure one required file is present and intact; true if downloaded
    async fn ensure_file(&self, file: &ContentFile) -> Result<bool> {
        let dest = self.media_dir.join(&file.filename);

        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            match &file.expected_hash {
                None => return Ok(false),
                Some(expected) => {
                    let actual = hash_file_async(dest.clone()).await?;
                    if actual.eq_ignore_ascii_case(expected) {
                        return Ok(false);
                    }
                    // Never leave a mismatched file where the engine can find it
                    warn!(
                        filename = %file.filename,
                        expected = %expected,
                        actual = %actual,
                        "Local file hash mismatch, re-downloading"
                    );
                    tokio::fs::remove_file(&dest).await?;
                }
            }
        }

        let client = self.client.clone();
        let content_id = file.content_id.clone();
        let done = download_verified(
            &self.policy,
            &file.filename,
            &dest,
            file.expected_hash.as_deref(),
            |part| {
                let client = client.clone();
                let content_id = content_id.clone();
                async move { client.download_content(&content_id, &part).await }
            },
        )
        .await?;

        info!(filename = %file.filename, bytes = done.bytes, "Downloaded content file");
        Ok(true)
    }

    fn record(&self, report: &SyncReport) {
        let now = Utc::now();
        let mut stats = self.lock_stats();
        stats.total_cycles += 1;
        stats.last_sync_at = Some(now);
        stats.files_downloaded += report.downloaded.len() as u64;
        if report.success {
            stats.consecutive_failures = 0;
            stats.last_success_at = Some(now);
            stats.last_error = None;
        } else {
            stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
            stats.total_failures += 1;
            stats.last_error = report.error.clone();
        }
    }

    fn finish(&self, report: &SyncReport, manifest: Option<&SyncManifest>) {
        let updated = report.content_updated();
        let complete = self
            .on_complete
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for observer in complete.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(report.success))).is_err() {
                error!("Sync-complete observer panicked");
            }
        }
        drop(complete);

        if let (true, Some(manifest)) = (updated, manifest) {
            let observers = self
                .on_updated
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for observer in observers.iter() {
                if catch_unwind(AssertUnwindSafe(|| observer(manifest))).is_err() {
                    error!("Content-updated observer panicked");
                }
            }
        }

        if let Some(state) = &self.state {
            if !report.skipped {
                state.broadcast_event(AgentEvent::ContentSyncCompleted {
                    success: report.success,
                    content_updated: updated,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Delete media files the current manifest no longer references
    ///
    /// Hidden and temp-prefixed names are left alone. Without a stored
    /// manifest nothing is deleted.
    pub async fn cleanup_orphans(&self) -> Result<Vec<String>> {
        let _cycle = self.cycle_lock.lock().await;
        let Some(manifest) = self.store.load_manifest() else {
            info!("No manifest stored, skipping orphan cleanup");
            return Ok(Vec::new());
        };
        let required: HashSet<String> = manifest
            .required_files()
            .into_iter()
            .map(|f| f.filename)
            .collect();

        let mut removed = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.media_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_protected_name(&name) || required.contains(&name) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    info!(filename = %name, "Removed orphan content file");
                    removed.push(name);
                }
                Err(e) => warn!(filename = %name, error = %e, "Failed to remove orphan"),
            }
        }
        removed.sort();
        Ok(removed)
    }

    /// Timer loop: one cycle now, then every interval or on [`Self::sync_now`]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Content sync loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.run_cycle() => {
                    if report.success {
                        debug!(downloaded = report.downloaded.len(), "Content sync cycle done");
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.wake.notified() => debug!("Content sync requested"),
            }
        }
        info!("Content sync loop stopped");
    }

    fn lock_stats(&self) -> MutexGuard<'_, ContentSyncStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Names orphan cleanup must never touch
fn is_protected_name(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('~') || name.starts_with("tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_names() {
        assert!(is_protected_name(".ad.mp4.part"));
        assert!(is_protected_name("tmp_upload"));
        assert!(is_protected_name("~lock"));
        assert!(!is_protected_name("ad.mp4"));
    }

    #[test]
    fn test_report_content_updated() {
        let mut report = SyncReport::default();
        assert!(!report.content_updated());
        report.downloaded.push("a.mp4".into());
        assert!(report.content_updated());
        let applied = SyncReport {
            manifest_applied: true,
            ..Default::default()
        };
        assert!(applied.content_updated());
    }
}
