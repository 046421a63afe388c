//! Safety alert queue
//!
//! Store-and-forward for safety matches. Every change to the pending list is
//! persisted before the call returns, so a crash loses nothing. Alerts carry
//! a case reference and a confidence score only.
//!
//! Queuing never touches the network. Forwarding happens on the flush loop,
//! which a new alert wakes immediately.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kiosk_common::config::AlertConfig;
use kiosk_common::events::AgentEvent;
use kiosk_common::models::{AlertStatus, PendingAlert};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authority::AuthorityClient;
use crate::error::Result;
use crate::snapshot::SnapshotSealer;
use crate::state::SharedState;
use crate::store::LocalStore;

/// Delivery channel for alerts
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn forward(&self, alert: &PendingAlert) -> Result<()>;
}

#[async_trait]
impl AlertTransport for AuthorityClient {
    async fn forward(&self, alert: &PendingAlert) -> Result<()> {
        self.post_alert(alert).await
    }
}

/// Persistent pending-alert list with bounded size
pub struct AlertQueue {
    pending: Mutex<Vec<PendingAlert>>,
    /// Serializes delivery so no alert is forwarded twice concurrently
    delivery: Mutex<()>,
    /// Wakes the flush loop for an immediate forward
    wake: Notify,
    store: Arc<LocalStore>,
    transport: Arc<dyn AlertTransport>,
    max_pending: usize,
    flush_interval: Duration,
    sealer: Option<SnapshotSealer>,
    state: Option<Arc<SharedState>>,
}

impl AlertQueue {
    /// Restore the pending list from the store
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn AlertTransport>,
        config: &AlertConfig,
    ) -> Result<Self> {
        let max_pending = config.max_pending.max(1);
        let mut pending = store.load_pending_alerts();
        if pending.len() > max_pending {
            let excess = pending.len() - max_pending;
            warn!(dropped = excess, max_pending, "Stored alert list over cap, dropping oldest");
            for dropped in pending.drain(..excess) {
                discard_snapshot(&dropped);
            }
            store.save_pending_alerts(&pending)?;
        }
        if !pending.is_empty() {
            info!(pending = pending.len(), "Restored pending alerts");
        }

        let sealer = match &config.snapshot_dir {
            Some(dir) => Some(SnapshotSealer::open(dir.clone(), store.root())?),
            None => None,
        };

        Ok(Self {
            pending: Mutex::new(pending),
            delivery: Mutex::new(()),
            wake: Notify::new(),
            store,
            transport,
            max_pending,
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
            sealer,
            state: None,
        })
    }

    pub fn with_events(mut self, state: Arc<SharedState>) -> Self {
        self.state = Some(state);
        self
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn pending(&self) -> Vec<PendingAlert> {
        self.pending.lock().await.clone()
    }

    /// Queue and persist an alert, then wake the flush loop to forward it
    pub async fn create_alert(
        &self,
        case_reference: impl Into<String>,
        confidence: f32,
    ) -> Result<PendingAlert> {
        self.enqueue(case_reference.into(), confidence, None).await
    }

    /// Like [`Self::create_alert`], sealing `snapshot` when snapshots are enabled
    ///
    /// Without a configured snapshot directory the bytes are dropped.
    pub async fn create_alert_with_snapshot(
        &self,
        case_reference: impl Into<String>,
        confidence: f32,
        snapshot: &[u8],
    ) -> Result<PendingAlert> {
        self.enqueue(case_reference.into(), confidence, Some(snapshot))
            .await
    }

    async fn enqueue(
        &self,
        case_reference: String,
        confidence: f32,
        snapshot: Option<&[u8]>,
    ) -> Result<PendingAlert> {
        let alert_id = Uuid::new_v4();
        let snapshot_ref = match (snapshot, &self.sealer) {
            (Some(bytes), Some(sealer)) => {
                Some(sealer.seal(alert_id, bytes)?.to_string_lossy().into_owned())
            }
            (Some(_), None) => {
                debug!(alert_id = %alert_id, "Snapshots disabled, dropping snapshot");
                None
            }
            (None, _) => None,
        };

        let alert = PendingAlert {
            alert_id,
            created_at: Utc::now(),
            case_reference,
            confidence,
            status: AlertStatus::Pending,
            snapshot_ref,
        };

        let pending_after = {
            let mut pending = self.pending.lock().await;
            while pending.len() >= self.max_pending {
                let dropped = pending.remove(0);
                warn!(
                    alert_id = %dropped.alert_id,
                    max_pending = self.max_pending,
                    "Alert queue full, dropping oldest alert"
                );
                discard_snapshot(&dropped);
            }
            pending.push(alert.clone());
            self.store.save_pending_alerts(&pending)?;
            pending.len()
        };
        info!(alert_id = %alert.alert_id, pending = pending_after, "Safety alert queued");

        if let Some(state) = &self.state {
            state.broadcast_event(AgentEvent::AlertQueued {
                alert_id: alert.alert_id,
                pending: pending_after,
                timestamp: Utc::now(),
            });
        }

        // Stored permit: a flush already running is followed by another one
        self.wake.notify_one();
        Ok(alert)
    }

    /// Try to forward every pending alert; returns how many were delivered
    pub async fn flush(&self) -> Result<usize> {
        let _delivery = self.delivery.lock().await;
        let snapshot = self.pending.lock().await.clone();
        let mut forwarded = 0;
        for alert in &snapshot {
            match self.deliver(alert).await {
                Ok(()) => forwarded += 1,
                Err(e) => {
                    debug!(alert_id = %alert.alert_id, error = %e, "Forward failed, kept pending");
                }
            }
        }
        if forwarded > 0 {
            info!(forwarded, remaining = snapshot.len() - forwarded, "Flushed safety alerts");
        }
        Ok(forwarded)
    }

    /// Forward one alert; on success remove it, persist, and audit
    async fn deliver(&self, alert: &PendingAlert) -> Result<()> {
        self.transport.forward(alert).await?;

        let remaining = {
            let mut pending = self.pending.lock().await;
            pending.retain(|a| a.alert_id != alert.alert_id);
            self.store.save_pending_alerts(&pending)?;
            pending.len()
        };

        let entry = serde_json::json!({
            "alert_id": alert.alert_id,
            "case_reference": alert.case_reference,
            "confidence": alert.confidence,
            "created_at": alert.created_at,
            "forwarded_at": Utc::now(),
            "status": AlertStatus::Forwarded,
        });
        if let Err(e) = self.store.append_audit(&entry.to_string()) {
            warn!(alert_id = %alert.alert_id, error = %e, "Failed to append audit entry");
        }
        discard_snapshot(alert);

        if let Some(state) = &self.state {
            state.broadcast_event(AgentEvent::AlertForwarded {
                alert_id: alert.alert_id,
                pending: remaining,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Flush on every new alert and periodically, until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => debug!("Immediate alert forward"),
                _ = tokio::time::sleep(self.flush_interval) => {}
            }
            if self.pending_count().await == 0 {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.flush() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Alert flush failed");
                    }
                }
            }
        }
        debug!("Alert flush loop stopped");
    }
}

/// Remove the sealed snapshot of an alert that left the queue
fn discard_snapshot(alert: &PendingAlert) {
    let Some(path) = alert.snapshot_ref.as_deref() else {
        return;
    };
    match std::fs::remove_file(Path::new(path)) {
        Ok(()) => debug!(alert_id = %alert.alert_id, "Snapshot removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(alert_id = %alert.alert_id, error = %e, "Failed to remove snapshot"),
    }
}
