//! Server-Sent Events (SSE) utilities
//!
//! Turns the agent's broadcast channel into an SSE response.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::AgentEvent;

/// Create an SSE stream that forwards every [`AgentEvent`] from `rx`
///
/// Lagging clients skip the events they missed instead of disconnecting.
pub fn agent_event_stream(
    mut rx: broadcast::Receiver<AgentEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected");

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("ConnectionStatus")
            .data("connected"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    match Event::default().event(event.event_type()).json_data(&event) {
                        Ok(sse_event) => yield Ok(sse_event),
                        Err(e) => warn!("SSE: failed to encode event: {}", e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("SSE: client lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("SSE: event channel closed");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
