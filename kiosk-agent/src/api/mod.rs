//! Local HTTP surface
//!
//! Status, event stream and a few administrative controls for on-site
//! tooling. Bound to all interfaces on the configured port.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::Agent;
use crate::error::{AgentError, Result};

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub agent: Arc<Agent>,
}

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/events", get(handlers::events))
        .route("/sync/now", post(handlers::sync_now))
        .route("/content/cleanup", post(handlers::cleanup_content))
        .route("/mode", post(handlers::set_mode))
        .route("/triggers", post(handlers::inject_trigger))
        .with_state(AppContext { agent })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve until `cancel` fires
pub async fn serve(agent: Arc<Agent>, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AgentError::Config(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Starting HTTP server on {}", addr);

    axum::serve(listener, router(agent))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| AgentError::Internal(format!("Server error: {}", e)))?;

    info!("HTTP server stopped");
    Ok(())
}
