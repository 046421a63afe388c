//! Trigger event routing
//!
//! Events from the perception pipeline arrive on an mpsc channel. Safety
//! alerts go to the alert queue in every mode; demographic and loyalty events
//! reach the decision engine only while the player is in PLAYBACK.

use std::sync::Arc;

use kiosk_common::events::{PlayerMode, TriggerEvent};
use kiosk_common::models::DatabaseKind;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::AlertQueue;
use crate::matching::Match;
use crate::mode::PlayerModeStateMachine;
use crate::playlist::{PlaylistDecisionEngine, TriggerOutcome};

/// What happened to one dispatched event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Playlist { result: TriggerOutcome },
    AlertQueued { alert_id: Uuid },
    /// Dropped because the player is not in PLAYBACK
    Ignored { mode: PlayerMode },
    Failed { error: String },
}

pub struct TriggerDispatcher {
    mode: Arc<PlayerModeStateMachine>,
    engine: Arc<PlaylistDecisionEngine>,
    alerts: Arc<AlertQueue>,
}

impl TriggerDispatcher {
    pub fn new(
        mode: Arc<PlayerModeStateMachine>,
        engine: Arc<PlaylistDecisionEngine>,
        alerts: Arc<AlertQueue>,
    ) -> Self {
        Self {
            mode,
            engine,
            alerts,
        }
    }

    pub async fn dispatch(&self, event: TriggerEvent) -> DispatchOutcome {
        debug!(kind = event.kind_name(), confidence = event.confidence(), "Trigger event");
        match event {
            TriggerEvent::SafetyAlert {
                case_ref,
                confidence,
            } => match self.alerts.create_alert(case_ref, confidence).await {
                Ok(alert) => DispatchOutcome::AlertQueued {
                    alert_id: alert.alert_id,
                },
                Err(e) => {
                    warn!(error = %e, "Failed to queue safety alert");
                    DispatchOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            },
            other => {
                let mode = self.mode.current();
                if mode != PlayerMode::Playback {
                    debug!(mode = %mode, "Not in playback, trigger ignored");
                    return DispatchOutcome::Ignored { mode };
                }
                DispatchOutcome::Playlist {
                    result: self.engine.handle_trigger(&other),
                }
            }
        }
    }

    /// Consume events until the channel closes or `cancel` fires
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<TriggerEvent>, cancel: CancellationToken) {
        info!("Trigger dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        self.dispatch(event).await;
                    }
                    None => break,
                },
            }
        }
        info!("Trigger dispatcher stopped");
    }
}

/// Turn a similarity hit into the trigger event it represents
///
/// Loyalty hits need a `member_id` and safety hits a `case_reference`
/// (or `case_ref`) in the record metadata; hits without one are dropped.
pub fn event_from_match(kind: DatabaseKind, hit: &Match) -> Option<TriggerEvent> {
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| hit.metadata.get(*name).and_then(|v| v.as_str()))
            .map(str::to_string)
    };
    match kind {
        DatabaseKind::Loyalty => field(&["member_id"]).map(|member_id| TriggerEvent::Loyalty {
            member_id: Some(member_id),
            confidence: hit.similarity,
        }),
        DatabaseKind::Safety => {
            field(&["case_reference", "case_ref"]).map(|case_ref| TriggerEvent::SafetyAlert {
                case_ref,
                confidence: hit.similarity,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn hit(metadata: serde_json::Value) -> Match {
        Match {
            index: 0,
            similarity: 0.93,
            metadata,
        }
    }

    #[test]
    fn test_loyalty_match_carries_member() {
        let event = event_from_match(DatabaseKind::Loyalty, &hit(json!({"member_id": "m-7"})));
        assert_eq!(
            event,
            Some(TriggerEvent::Loyalty {
                member_id: Some("m-7".into()),
                confidence: 0.93
            })
        );
    }

    #[test]
    fn test_safety_match_accepts_either_case_field() {
        for meta in [json!({"case_reference": "C-1"}), json!({"case_ref": "C-1"})] {
            match event_from_match(DatabaseKind::Safety, &hit(meta)) {
                Some(TriggerEvent::SafetyAlert { case_ref, .. }) => assert_eq!(case_ref, "C-1"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_match_without_identifier_is_dropped() {
        assert!(event_from_match(DatabaseKind::Loyalty, &hit(serde_json::Value::Null)).is_none());
        assert!(event_from_match(DatabaseKind::Safety, &hit(json!({"other": 1}))).is_none());
    }
}
