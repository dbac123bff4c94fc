//! Run event stream.
//!
//! The engine is the single producer of a totally ordered event
//! sequence per run. Sinks are push targets and must not block; the
//! bounded channel sink drops on overflow and counts what it dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use tiller_domain::{ApprovalStatus, RunOutcome, ToolCall};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event union
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhaseKind {
    Started,
    Completed,
    Failed,
}

/// One entry of a `tool_calls_requested` event.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallSummary {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl From<&ToolCall> for ToolCallSummary {
    fn from(tc: &ToolCall) -> Self {
        Self {
            id: tc.id.clone(),
            name: tc.name.clone(),
            args: serde_json::from_str(&tc.arguments).unwrap_or(Value::Null),
        }
    }
}

/// Events emitted over the lifetime of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStart {
        run_id: String,
        trace_id: String,
        conversation_id: String,
        agent_name: String,
    },
    AssistantMessage {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
    },
    ToolCallsRequested {
        calls: Vec<ToolCallSummary>,
    },
    ToolPhase {
        tool_call_id: String,
        phase: ToolPhaseKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ApprovalRequired {
        tool_call_id: String,
        tool_name: String,
        args: Value,
        signature: String,
    },
    ApprovalDecision {
        tool_call_id: String,
        status: ApprovalStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        additional_context: Option<Value>,
    },
    /// Tool-emitted; passed through unchanged.
    ToolPartialResult {
        tool_call_id: String,
        data: Value,
    },
    ToolStreamingOutput {
        tool_call_id: String,
        chunk: String,
    },
    ToolProgressUpdate {
        tool_call_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
    },
    TokenUsage {
        prompt: u32,
        completion: u32,
        total: u32,
    },
    RunEnd {
        outcome: RunOutcome,
    },
    Error {
        message: String,
        kind: String,
    },
}

impl RunEvent {
    /// The SSE event name for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "run_start",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::ToolCallsRequested { .. } => "tool_calls_requested",
            Self::ToolPhase { .. } => "tool_phase",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::ApprovalDecision { .. } => "approval_decision",
            Self::ToolPartialResult { .. } => "tool_partial_result",
            Self::ToolStreamingOutput { .. } => "tool_streaming_output",
            Self::ToolProgressUpdate { .. } => "tool_progress_update",
            Self::TokenUsage { .. } => "token_usage",
            Self::RunEnd { .. } => "run_end",
            Self::Error { .. } => "error",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sinks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A push target for run events. `send` must return promptly; slow
/// consumers buffer behind a bounded channel and drop on overflow.
pub trait EventSink: Send + Sync {
    fn send(&self, event: &RunEvent);

    /// Events this sink has dropped so far.
    fn dropped(&self) -> u64 {
        0
    }
}

/// Fans every event out to the registered sinks, in registration order.
#[derive(Default, Clone)]
pub struct EventBus {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub fn emit(&self, event: RunEvent) {
        let sinks = self.sinks.read();
        for sink in sinks.iter() {
            sink.send(&event);
        }
    }

    /// Total events dropped across all sinks.
    pub fn dropped_total(&self) -> u64 {
        self.sinks.read().iter().map(|s| s.dropped()).sum()
    }
}

/// Bridges events into a bounded mpsc channel; overflow is dropped and
/// counted rather than blocking the engine.
pub struct ChannelSink {
    tx: mpsc::Sender<RunEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Returns the sink and the receiving half.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx,
                dropped: AtomicU64::new(0),
            }),
            rx,
        )
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: &RunEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// In-memory sink for tests and introspection.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind()).collect()
    }
}

impl EventSink for CollectingSink {
    fn send(&self, event: &RunEvent) {
        self.events.lock().push(event.clone());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
