//! Approval endpoints: the pending set and the decision stream.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::Value;

use tiller_domain::tool_call_signature;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationQuery {
    pub conversation_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /approvals/pending
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Derive the pending set from the last assistant message whose tool
/// results are absent.
pub async fn pending(
    State(state): State<AppState>,
    Query(query): Query<ConversationQuery>,
) -> axum::response::Response {
    let Some(memory) = &state.memory else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "success": false, "error": "memory provider is not configured" })),
        )
            .into_response();
    };

    let record = match memory.get_conversation(&query.conversation_id).await {
        Ok(record) => record,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let mut pending = Vec::new();
    if let Some(record) = record {
        let answered: std::collections::HashSet<&str> = record
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        let last_with_tools = record
            .messages
            .iter()
            .rev()
            .find(|m| m.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty()));
        if let Some(message) = last_with_tools {
            for call in message.tool_calls.as_deref().unwrap_or_default() {
                if answered.contains(call.id.as_str()) {
                    continue;
                }
                let args: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
                pending.push(serde_json::json!({
                    "toolCallId": call.id,
                    "toolName": call.name,
                    "args": args,
                    "signature": tool_call_signature(call),
                    "status": "pending",
                }));
            }
        }
    }

    Json(serde_json::json!({ "pending": pending })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /approvals/stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    /// When present, only this conversation's events are forwarded.
    pub conversation_id: Option<String>,
}

/// SSE of `approval_required` / `approval_decision` events.
pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> axum::response::Response {
    let mut rx = state.approval_stream.subscribe();
    let filter = query.conversation_id;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    if let Some(wanted) = &filter {
                        if &item.conversation_id != wanted {
                            continue;
                        }
                    }
                    let data = serde_json::to_string(&item.event).unwrap_or_default();
                    yield Ok::<_, std::convert::Infallible>(
                        Event::default().event(item.event.kind()).data(data),
                    );
                }
                // Lagged subscribers skip ahead; a closed channel ends
                // the stream.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
