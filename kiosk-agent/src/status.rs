//! Structured status snapshot for external health reporting

use chrono::{DateTime, Utc};
use kiosk_common::events::PlayerMode;
use kiosk_common::models::{ConnectivityState, DatabaseKind};
use kiosk_common::time::seconds_since;
use serde::Serialize;

use crate::agent::Agent;
use crate::playlist::PlaylistInfo;
use crate::sync::{ContentSyncStats, DatabaseSyncStatus};

/// What is loaded in memory for one match database
#[derive(Debug, Clone, Serialize)]
pub struct MatchDatabaseStatus {
    pub kind: DatabaseKind,
    pub loaded: bool,
    pub version_token: Option<String>,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub mode: PlayerMode,
    pub pairing_code: Option<String>,
    pub playlist: PlaylistInfo,
    pub now_playing: Option<String>,
    pub content_sync: ContentSyncStats,
    pub databases: Vec<DatabaseSyncStatus>,
    pub match_databases: Vec<MatchDatabaseStatus>,
    pub connectivity: ConnectivityState,
    pub pending_alerts: usize,
}

impl StatusSnapshot {
    pub async fn collect(agent: &Agent) -> Self {
        let match_databases = DatabaseKind::ALL
            .iter()
            .map(|kind| {
                let generation = agent.match_database(*kind).generation();
                MatchDatabaseStatus {
                    kind: *kind,
                    loaded: generation.is_some(),
                    version_token: generation.as_ref().map(|g| g.version_token().to_string()),
                    rows: generation.as_ref().map_or(0, |g| g.len()),
                }
            })
            .collect();

        Self {
            device_id: agent.state.device_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: agent.state.started_at,
            uptime_secs: seconds_since(agent.state.started_at),
            mode: agent.mode.current(),
            pairing_code: agent.pairing.current_code(),
            playlist: agent.engine.info(),
            now_playing: agent.driver.now_playing(),
            content_sync: agent.content.stats(),
            databases: agent.databases.status(),
            match_databases,
            connectivity: agent.connectivity.snapshot(),
            pending_alerts: agent.alerts.pending_count().await,
        }
    }
}
