//! Shared application state passed to all API handlers.

use std::sync::Arc;

use tokio::sync::broadcast;

use tiller_domain::config::Config;
use tiller_engine::{
    ApprovalStore, AuthRuntime, Engine, EngineSettings, EventSink, RunEvent,
};
use tiller_memory::MemoryProvider;
use tiller_providers::ModelProvider;

use crate::run_lock::RunLockMap;

/// An approval event tagged with the conversation it belongs to, for
/// the `/approvals/stream` fan-out.
#[derive(Debug, Clone)]
pub struct ApprovalStreamEvent {
    pub conversation_id: String,
    pub event: RunEvent,
}

#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────
    pub config: Arc<Config>,
    pub provider: Arc<dyn ModelProvider>,
    pub agents: Arc<tiller_engine::AgentRegistry>,
    pub auth: Arc<AuthRuntime>,

    // ── Persistence ───────────────────────────────────────────────
    /// None = memory/approval endpoints answer 503.
    pub memory: Option<Arc<dyn MemoryProvider>>,
    pub approvals: Option<Arc<ApprovalStore>>,

    // ── Runtime ───────────────────────────────────────────────────
    pub run_locks: Arc<RunLockMap>,
    /// Broadcast of approval events across all runs.
    pub approval_stream: broadcast::Sender<ApprovalStreamEvent>,
}

impl AppState {
    /// Build a run engine wired to this state plus per-request sinks.
    ///
    /// Engines are cheap: one is assembled per run so each request gets
    /// its own event channel while sharing every store underneath.
    pub fn build_engine(
        &self,
        conversation_id: &str,
        extra_sinks: Vec<Arc<dyn EventSink>>,
    ) -> tiller_domain::Result<Engine> {
        let mut builder = Engine::builder(self.provider.clone(), self.agents.clone())
            .auth(self.auth.clone())
            .settings(EngineSettings::from(&self.config.engine))
            .sink(Arc::new(ApprovalForwardSink {
                conversation_id: conversation_id.to_owned(),
                tx: self.approval_stream.clone(),
            }));
        if let Some(memory) = &self.memory {
            builder = builder.memory(memory.clone());
        }
        for sink in extra_sinks {
            builder = builder.sink(sink);
        }
        builder.build()
    }

    /// Re-broadcast a decision submitted through the chat body.
    pub fn broadcast_approval(&self, conversation_id: &str, event: RunEvent) {
        let _ = self.approval_stream.send(ApprovalStreamEvent {
            conversation_id: conversation_id.to_owned(),
            event,
        });
    }
}

/// Forwards approval events from a run onto the shared broadcast.
struct ApprovalForwardSink {
    conversation_id: String,
    tx: broadcast::Sender<ApprovalStreamEvent>,
}

impl EventSink for ApprovalForwardSink {
    fn send(&self, event: &RunEvent) {
        if matches!(
            event,
            RunEvent::ApprovalRequired { .. } | RunEvent::ApprovalDecision { .. }
        ) {
            let _ = self.tx.send(ApprovalStreamEvent {
                conversation_id: self.conversation_id.clone(),
                event: event.clone(),
            });
        }
    }
}
