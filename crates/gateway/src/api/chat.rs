//! `POST /chat` — run one agent turn loop, non-streaming or SSE.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tiller_domain::{ApprovalEntry, ApprovalStatus, Message, RunOutcome, RunState};
use tiller_engine::{ChannelSink, RunEvent, RunResult};
use tiller_memory::ConversationMetadata;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub agent_name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub memory: Option<MemoryOptions>,
    #[serde(default)]
    pub approvals: Vec<ApprovalSubmission>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryOptions {
    pub auto_store: Option<bool>,
    pub max_messages: Option<usize>,
    pub compression_threshold: Option<usize>,
    pub store_on_completion: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSubmission {
    pub tool_call_id: String,
    pub session_id: String,
    pub approved: bool,
    #[serde(default)]
    pub additional_context: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(State(state): State<AppState>, Json(body): Json<ChatRequest>) -> axum::response::Response {
    // ── Validation ────────────────────────────────────────────────
    let Some(agent) = state.agents.get(&body.agent_name) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("unknown agent '{}'", body.agent_name),
        );
    };
    for message in &body.messages {
        if let Err(e) = message.validate() {
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    }

    let conversation_id = body
        .conversation_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // ── Run lock ──────────────────────────────────────────────────
    let permit = match state.run_locks.acquire(&conversation_id) {
        Ok(p) => p,
        Err(busy) => return error_response(StatusCode::TOO_MANY_REQUESTS, busy.to_string()),
    };

    // ── Seed approvals submitted in the body ──────────────────────
    if !body.approvals.is_empty() {
        let Some(approvals) = &state.approvals else {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "approval store is not configured".into(),
            );
        };
        for submission in &body.approvals {
            let status = if submission.approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Rejected
            };
            let mut entry = ApprovalEntry::new(status);
            entry.additional_context = submission.additional_context.clone();
            match approvals
                .record(
                    &conversation_id,
                    &submission.session_id,
                    &submission.tool_call_id,
                    entry,
                )
                .await
            {
                Ok(recorded) => {
                    state.broadcast_approval(
                        &conversation_id,
                        RunEvent::ApprovalDecision {
                            tool_call_id: submission.tool_call_id.clone(),
                            status,
                            additional_context: recorded.additional_context,
                        },
                    );
                }
                Err(e) => {
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
                }
            }
        }
    }

    // ── Load the conversation and assemble the run state ─────────
    let loaded = match &state.memory {
        Some(memory) => match memory.get_conversation(&conversation_id).await {
            Ok(record) => record.map(|r| r.messages).unwrap_or_default(),
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        None => Vec::new(),
    };
    let persisted_len = loaded.len();

    let mut run_state = RunState::new(agent.name.clone(), conversation_id.clone())
        .with_messages(loaded)
        .with_messages(body.messages.clone());
    if let Some(context) = &body.context {
        run_state = run_state.with_context(context.clone());
    }

    // ── Run ───────────────────────────────────────────────────────
    let streaming = body.stream.unwrap_or(false);
    let cancel = CancellationToken::new();

    if !streaming {
        let engine = match state.build_engine(&conversation_id, Vec::new()) {
            Ok(engine) => engine,
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        let result = engine
            .run_with_agent(agent, run_state, cancel, body.max_turns)
            .await;
        persist_run(&state, &conversation_id, &body.memory, persisted_len, &result).await;
        drop(permit);
        return Json(envelope(&conversation_id, &result)).into_response();
    }

    // ── SSE ───────────────────────────────────────────────────────
    let buffer = state.config.engine.event_buffer;
    let (sink, rx) = ChannelSink::new(buffer);
    let sinks: Vec<Arc<dyn tiller_engine::EventSink>> = vec![sink];
    let engine = match state.build_engine(&conversation_id, sinks) {
        Ok(engine) => engine,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let run_cancel = cancel.clone();
    let run_state_for_task = run_state;
    let state_for_task = state.clone();
    let memory_opts = body.memory.clone();
    let conversation_for_task = conversation_id.clone();
    let max_turns = body.max_turns;
    tokio::spawn(async move {
        let result = engine
            .run_with_agent(agent, run_state_for_task, run_cancel, max_turns)
            .await;
        persist_run(
            &state_for_task,
            &conversation_for_task,
            &memory_opts,
            persisted_len,
            &result,
        )
        .await;
        // Permit releases when the run is fully finished, not when the
        // client goes away.
        drop(permit);
    });

    let stream = sse_stream(rx, cancel.drop_guard());
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn sse_stream(
    mut rx: tokio::sync::mpsc::Receiver<RunEvent>,
    disconnect_guard: tokio_util::sync::DropGuard,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        // The guard lives inside the generator: a client disconnect
        // drops the whole stream, which cancels the in-flight run.
        let _guard = disconnect_guard;
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event(event.kind()).data(data));
            if matches!(event, RunEvent::RunEnd { .. }) {
                break;
            }
        }
        yield Ok(Event::default().event("stream_end").data("{}"));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append the run's new messages to memory. Failures here are logged
/// and swallowed so bookkeeping can never poison a finished run.
async fn persist_run(
    state: &AppState,
    conversation_id: &str,
    options: &Option<MemoryOptions>,
    persisted_len: usize,
    result: &RunResult,
) {
    let Some(memory) = &state.memory else { return };

    let opts = options.clone().unwrap_or_default();
    let auto_store = opts.auto_store.unwrap_or(state.config.memory.auto_store);
    if !auto_store {
        return;
    }
    if opts.store_on_completion.unwrap_or(false) && !result.outcome.is_terminal_success() {
        return;
    }

    let new_messages = &result.state.messages[persisted_len.min(result.state.messages.len())..];
    if new_messages.is_empty() {
        return;
    }

    let patch = ConversationMetadata {
        trace_id: Some(result.state.trace_id.clone()),
        run_id: Some(result.state.run_id.clone()),
        ..Default::default()
    };
    if let Err(e) = memory
        .append_messages(conversation_id, new_messages, Some(patch))
        .await
    {
        tracing::warn!(
            conversation_id,
            error = %e,
            "failed to persist run transcript"
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response shaping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn envelope(conversation_id: &str, result: &RunResult) -> Value {
    serde_json::json!({
        "success": !matches!(result.outcome, RunOutcome::Error { .. }),
        "data": {
            "runId": result.state.run_id,
            "traceId": result.state.trace_id,
            "conversationId": conversation_id,
            "messages": result.state.messages,
            "outcome": result.outcome,
            "turnCount": result.state.turn_count,
            "executionTimeMs": result.execution_time_ms,
            "usage": {
                "prompt": result.usage.prompt_tokens,
                "completion": result.usage.completion_tokens,
                "total": result.usage.total_tokens,
            },
        },
    })
}

fn error_response(status: StatusCode, message: String) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}
