//! API Router and Application State
//!
//! Central routing configuration and shared state.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::{config::Config, hub::RoomHub, ws};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Relay configuration
    pub config: Arc<Config>,
    /// Room membership and fan-out
    pub hub: Arc<RoomHub>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = RoomHub::new(config.max_room_members);
        Self {
            config: Arc::new(config),
            hub: Arc::new(hub),
        }
    }
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // WebSocket
        .route("/ws", get(ws::handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        // State
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    /// Service status
    status: &'static str,
    /// Rooms with at least one member
    rooms: usize,
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        rooms: state.hub.room_count(),
    })
}
