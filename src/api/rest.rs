// =============================================================================
// HTTP Router — Axum 0.7
// =============================================================================
//
// `/ws` upgrades to the consumer WebSocket; `/health` reports liveness and a
// few counters. CORS is permissive so that browser dashboards on another
// origin can connect.
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}
