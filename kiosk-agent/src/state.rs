//! Shared agent state
//!
//! Holds only what every component needs read access to: the device
//! identity and the event broadcaster. Mutable domain state (cursors, mode,
//! connectivity counters, pending alerts) stays inside its owning component.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use kiosk_common::events::AgentEvent;

/// Shared state accessible by all components
pub struct SharedState {
    /// Hardware/device identifier sent with every authority request
    pub device_id: String,

    /// Process start time, reported in status snapshots
    pub started_at: DateTime<Utc>,

    /// Event broadcaster for observers and SSE clients
    pub event_tx: broadcast::Sender<AgentEvent>,
}

impl SharedState {
    /// Create new shared state for `device_id`
    pub fn new(device_id: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(100); // Buffer up to 100 events
        Self {
            device_id: device_id.into(),
            started_at: Utc::now(),
            event_tx,
        }
    }

    /// Broadcast an event to all listeners
    pub fn broadcast_event(&self, event: AgentEvent) {
        // Ignore send errors (no receivers is OK)
        let _ = self.event_tx.send(event);
    }

    /// Subscribe to the event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }
}
