//! Wires config into a running [`AppState`].

use std::sync::Arc;

use tokio::sync::broadcast;

use tiller_domain::config::Config;
use tiller_engine::{AgentDef, AgentRegistry, ApprovalStore, AuthRuntime, AuthStore, HttpTokenExchanger};
use tiller_memory::{InMemoryMemory, MemoryProvider, RetentionPolicy};
use tiller_providers::{ModelProvider, OpenAiCompatProvider, RetryProvider};
use tiller_store::InMemoryKv;

use crate::builtins;
use crate::run_lock::RunLockMap;
use crate::state::AppState;

const APPROVAL_STREAM_CAPACITY: usize = 256;

pub fn build_state(config: Config) -> anyhow::Result<AppState> {
    let config = Arc::new(config);

    // ── Model provider ────────────────────────────────────────────
    let api_key = std::env::var(&config.model.api_key_env).ok();
    if api_key.is_none() {
        tracing::warn!(
            env = %config.model.api_key_env,
            "model API key env var is unset; model calls will be unauthenticated"
        );
    }
    let base: Arc<dyn ModelProvider> = Arc::new(OpenAiCompatProvider::new(
        "openai",
        config.model.base_url.clone(),
        api_key,
        config.model.model.clone(),
    )?);
    let provider: Arc<dyn ModelProvider> = if config.model.retries > 0 {
        Arc::new(RetryProvider::new(base, config.model.retries))
    } else {
        base
    };

    // ── Agents ────────────────────────────────────────────────────
    let agents = Arc::new(AgentRegistry::new());
    for (name, agent_cfg) in &config.agents {
        let mut def = AgentDef::new(name.clone(), agent_cfg.instructions.clone());
        for tool_name in &agent_cfg.tools {
            match builtins::resolve(tool_name) {
                Some(tool) => def = def.with_tool(tool),
                None => {
                    tracing::warn!(agent = %name, tool = %tool_name, "unknown tool in config; skipped")
                }
            }
        }
        if let Some(max_turns) = agent_cfg.max_turns {
            def = def.with_max_turns(max_turns);
        }
        if let Some(model) = &agent_cfg.model {
            def = def.with_model(model.clone());
        }
        agents.register(def);
        tracing::info!(agent = %name, tools = ?agent_cfg.tools, "registered agent");
    }
    if agents.is_empty() {
        let mut def = AgentDef::new("assistant", "You are a helpful assistant.");
        for tool_name in ["clock", "echo"] {
            if let Some(tool) = builtins::resolve(tool_name) {
                def = def.with_tool(tool);
            }
        }
        agents.register(def);
        tracing::info!("no agents configured; registered default 'assistant'");
    }

    // ── Stores ────────────────────────────────────────────────────
    let memory: Arc<dyn MemoryProvider> = Arc::new(InMemoryMemory::with_retention(RetentionPolicy {
        max_messages: config.memory.max_messages,
        compression_threshold: config.memory.compression_threshold,
    }));
    let approvals = Arc::new(ApprovalStore::new(memory.clone()));
    let auth = Arc::new(AuthRuntime::new(
        AuthStore::new(Arc::new(InMemoryKv::new())),
        Arc::new(HttpTokenExchanger::new()?),
    ));

    let (approval_stream, _) = broadcast::channel(APPROVAL_STREAM_CAPACITY);

    Ok(AppState {
        config,
        provider,
        agents,
        auth,
        memory: Some(memory),
        approvals: Some(approvals),
        run_locks: Arc::new(RunLockMap::new()),
        approval_stream,
    })
}
