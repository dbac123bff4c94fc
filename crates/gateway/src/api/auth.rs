//! `POST /auth/submit` — the OAuth callback boundary.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSubmission {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub session_id: String,
    pub tool_call_id: String,
    pub auth_response_uri: String,
    pub redirect_uri: String,
}

/// Deposit the one-shot authorization response for the suspended tool
/// invocation routed by `(session_id, tool_call_id)`. The next `/chat`
/// on the same conversation resumes and performs the exchange.
pub async fn submit(
    State(state): State<AppState>,
    Json(body): Json<AuthSubmission>,
) -> axum::response::Response {
    match state
        .auth
        .submit_response(
            &body.session_id,
            &body.tool_call_id,
            &body.auth_response_uri,
            &body.redirect_uri,
        )
        .await
    {
        Ok(true) => Json(serde_json::json!({ "success": true })).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "success": false,
                "error": "no pending authorization for this session and tool call",
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}
