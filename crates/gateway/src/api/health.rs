//! `GET /health` — aggregate readiness of the runtime's stores.

use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> axum::response::Response {
    let memory = match &state.memory {
        Some(memory) => match memory.health_check().await {
            Ok(()) => "ok",
            Err(_) => "failing",
        },
        None => "unconfigured",
    };
    let auth = match state.auth.store().health_check().await {
        Ok(()) => "ok",
        Err(_) => "failing",
    };

    Json(serde_json::json!({
        "status": "ok",
        "agents": state.agents.list(),
        "memory": memory,
        "auth": auth,
        "activeConversations": state.run_locks.conversation_count(),
    }))
    .into_response()
}
