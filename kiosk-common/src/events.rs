//! Event types for the kiosk agent
//!
//! Two families live here:
//! - [`TriggerEvent`]: inbound signals from the perception pipeline
//! - [`AgentEvent`]: outbound notifications broadcast to observers and SSE clients

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::DatabaseKind;

/// Inbound trigger event
///
/// Wire format is internally tagged on `type`, matching what the perception
/// pipeline emits (`demographic`, `loyalty`, `ncmec_alert`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEvent {
    /// Demographic estimate for the person in front of the screen
    Demographic {
        #[serde(default)]
        age: Option<u32>,
        #[serde(default)]
        gender: Option<String>,
        #[serde(default)]
        confidence: f32,
    },

    /// Loyalty-programme member recognised
    Loyalty {
        #[serde(default)]
        member_id: Option<String>,
        #[serde(default)]
        confidence: f32,
    },

    /// Safety database match; never changes playback
    #[serde(rename = "ncmec_alert")]
    SafetyAlert {
        case_ref: String,
        #[serde(default)]
        confidence: f32,
    },
}

impl TriggerEvent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TriggerEvent::Demographic { .. } => "demographic",
            TriggerEvent::Loyalty { .. } => "loyalty",
            TriggerEvent::SafetyAlert { .. } => "ncmec_alert",
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            TriggerEvent::Demographic { confidence, .. }
            | TriggerEvent::Loyalty { confidence, .. }
            | TriggerEvent::SafetyAlert { confidence, .. } => *confidence,
        }
    }
}

/// Top-level player mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerMode {
    Pairing,
    Playback,
    Menu,
}

impl PlayerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerMode::Pairing => "pairing",
            PlayerMode::Playback => "playback",
            PlayerMode::Menu => "menu",
        }
    }
}

impl fmt::Display for PlayerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which playlist the decision engine is drawing from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    Default,
    Triggered,
}

/// Outbound agent notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Player mode transition committed
    ModeChanged {
        from: PlayerMode,
        to: PlayerMode,
        timestamp: DateTime<Utc>,
    },

    /// Decision engine switched playlist
    PlaylistChanged {
        mode: PlaybackMode,
        playlist_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A content sync cycle finished
    ContentSyncCompleted {
        success: bool,
        content_updated: bool,
        timestamp: DateTime<Utc>,
    },

    /// A verified database download was recorded
    DatabaseUpdated {
        kind: DatabaseKind,
        version_token: String,
        timestamp: DateTime<Utc>,
    },

    /// Database sync failed (network or integrity)
    DatabaseSyncFailed {
        kind: DatabaseKind,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Debounced online/offline transition
    ConnectivityChanged {
        online: bool,
        timestamp: DateTime<Utc>,
    },

    /// Safety alert persisted for delivery
    AlertQueued {
        alert_id: Uuid,
        pending: usize,
        timestamp: DateTime<Utc>,
    },

    /// Safety alert confirmed forwarded
    AlertForwarded {
        alert_id: Uuid,
        pending: usize,
        timestamp: DateTime<Utc>,
    },

    /// Item handed to the video pipeline
    NowPlaying {
        uri: String,
        timestamp: DateTime<Utc>,
    },
}

impl AgentEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::ModeChanged { .. } => "ModeChanged",
            AgentEvent::PlaylistChanged { .. } => "PlaylistChanged",
            AgentEvent::ContentSyncCompleted { .. } => "ContentSyncCompleted",
            AgentEvent::DatabaseUpdated { .. } => "DatabaseUpdated",
            AgentEvent::DatabaseSyncFailed { .. } => "DatabaseSyncFailed",
            AgentEvent::ConnectivityChanged { .. } => "ConnectivityChanged",
            AgentEvent::AlertQueued { .. } => "AlertQueued",
            AgentEvent::AlertForwarded { .. } => "AlertForwarded",
            AgentEvent::NowPlaying { .. } => "NowPlaying",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_event_wire_names() {
        let alert: TriggerEvent =
            serde_json::from_str(r#"{"type":"ncmec_alert","case_ref":"C-1","confidence":0.97}"#)
                .unwrap();
        assert_eq!(
            alert,
            TriggerEvent::SafetyAlert {
                case_ref: "C-1".into(),
                confidence: 0.97
            }
        );

        let demo: TriggerEvent =
            serde_json::from_str(r#"{"type":"demographic","age":30,"gender":"male"}"#).unwrap();
        assert_eq!(demo.kind_name(), "demographic");
        assert_eq!(demo.confidence(), 0.0);
    }

    #[test]
    fn test_unknown_trigger_type_is_rejected() {
        let parsed = serde_json::from_str::<TriggerEvent>(r#"{"type":"weather"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_agent_event_is_tagged() {
        let event = AgentEvent::ConnectivityChanged {
            online: true,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ConnectivityChanged");
        assert_eq!(event.event_type(), "ConnectivityChanged");
    }
}
