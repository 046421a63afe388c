//! HTTP request handlers

use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, Sse},
    Json,
};
use futures::stream::Stream;
use kiosk_common::events::{PlayerMode, TriggerEvent};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::AppContext;
use crate::dispatch::DispatchOutcome;
use crate::error::AgentError;
use crate::mode::TransitionOutcome;
use crate::status::StatusSnapshot;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: PlayerMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModeResponse {
    pub from: PlayerMode,
    pub to: PlayerMode,
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub removed: Vec<String>,
}

type ApiError = (StatusCode, Json<StatusResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(StatusResponse {
            status: format!("error: {}", message.into()),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "kiosk_agent".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /status
pub async fn status(State(ctx): State<AppContext>) -> Json<StatusSnapshot> {
    Json(ctx.agent.status().await)
}

/// GET /events - SSE stream of agent events
pub async fn events(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    kiosk_common::sse::agent_event_stream(ctx.agent.state.subscribe_events())
}

/// POST /sync/now - wake the content and database loops
pub async fn sync_now(State(ctx): State<AppContext>) -> (StatusCode, Json<StatusResponse>) {
    info!("Manual sync requested");
    ctx.agent.content.sync_now();
    ctx.agent.databases.sync_now();
    (
        StatusCode::ACCEPTED,
        Json(StatusResponse {
            status: "sync requested".to_string(),
        }),
    )
}

/// POST /content/cleanup - delete media files no longer referenced
pub async fn cleanup_content(
    State(ctx): State<AppContext>,
) -> Result<Json<CleanupResponse>, ApiError> {
    match ctx.agent.content.cleanup_orphans().await {
        Ok(removed) => {
            info!(removed = removed.len(), "Orphan cleanup finished");
            Ok(Json(CleanupResponse { removed }))
        }
        Err(e) => {
            error!(error = %e, "Orphan cleanup failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// POST /mode - request a player mode transition
///
/// 409 when the transition is not allowed from the current mode.
pub async fn set_mode(
    State(ctx): State<AppContext>,
    Json(request): Json<ModeRequest>,
) -> Result<Json<ModeResponse>, ApiError> {
    match ctx.agent.mode.transition(request.mode) {
        Ok(TransitionOutcome::Changed { from, to }) => Ok(Json(ModeResponse {
            from,
            to,
            changed: true,
        })),
        Ok(TransitionOutcome::NoChange) => Ok(Json(ModeResponse {
            from: request.mode,
            to: request.mode,
            changed: false,
        })),
        Err(e @ AgentError::InvalidTransition { .. }) => {
            warn!(error = %e, "Rejected mode change");
            Err(api_error(StatusCode::CONFLICT, e.to_string()))
        }
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// POST /triggers - inject a trigger event as if from the perception pipeline
pub async fn inject_trigger(
    State(ctx): State<AppContext>,
    Json(event): Json<TriggerEvent>,
) -> Json<DispatchOutcome> {
    Json(ctx.agent.dispatcher.dispatch(event).await)
}
