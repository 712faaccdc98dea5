//! Axum Router Configuration
//!
//! Wires up the call-setup HTTP endpoints and the media-stream WebSocket
//! endpoint that carries the actual call audio.

use crate::{handlers, state::AppState, ws::media_stream_handler};

use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route(
            "/incoming-call",
            get(handlers::incoming_call).post(handlers::incoming_call),
        )
        .route("/media-stream", get(media_stream_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
