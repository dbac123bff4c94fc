//! Router assembly.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(super::chat::chat))
        .route("/approvals/pending", get(super::approvals::pending))
        .route("/approvals/stream", get(super::approvals::stream))
        .route("/auth/submit", post(super::auth::submit))
        .route("/health", get(super::health::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
