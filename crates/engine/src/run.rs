//! The turn loop.
//!
//! One task owns one run at a time; every await point (model call,
//! tool execution, emitter push) happens between state transitions,
//! never inside them. Resume is replay: a tool call whose result is
//! already in the transcript is skipped, so re-invoking the engine
//! with the same conversation and decisions reproduces the same
//! terminal outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tiller_domain::{
    tool_call_signature, ApprovalEntry, ApprovalStatus, Error, ErrorKind, Interruption, Message,
    RunOutcome, RunState, ToolCall,
};
use tiller_memory::MemoryProvider;
use tiller_providers::{ModelProvider, ModelRequest, TokenUsage};
use tiller_store::InMemoryKv;

use crate::approval::{rehydrate, ApprovalStore};
use crate::auth::{AuthDecision, AuthRuntime, AuthStore, HttpTokenExchanger};
use crate::events::{EventBus, EventSink, RunEvent, ToolCallSummary, ToolPhaseKind};
use crate::hooks::{fire_hook, NoopHooks, RunHooks};
use crate::registry::{AgentDef, AgentRegistry};
use crate::tool::{Tool, ToolContext, ToolOutcome, CODE_EXECUTION_FAILED, CODE_INVALID_INPUT};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Turn cap when neither the agent nor the caller sets one.
    pub default_max_turns: u32,
    pub model_timeout: Duration,
    /// Per-tool timeout. None = unbounded.
    pub tool_timeout: Option<Duration>,
    /// Grace window an in-flight tool gets after cancellation.
    pub cancel_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_max_turns: 10,
            model_timeout: Duration::from_secs(30),
            tool_timeout: None,
            cancel_grace: Duration::from_millis(500),
        }
    }
}

impl From<&tiller_domain::config::EngineConfig> for EngineSettings {
    fn from(cfg: &tiller_domain::config::EngineConfig) -> Self {
        Self {
            default_max_turns: cfg.max_turns,
            model_timeout: Duration::from_secs(cfg.model_timeout_secs),
            tool_timeout: cfg.tool_timeout_secs.map(Duration::from_secs),
            cancel_grace: Duration::from_millis(cfg.cancel_grace_ms),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal result of one run.
#[derive(Debug)]
pub struct RunResult {
    pub state: RunState,
    pub outcome: RunOutcome,
    pub usage: TokenUsage,
    pub execution_time_ms: u64,
}

struct EngineInner {
    provider: Arc<dyn ModelProvider>,
    agents: Arc<AgentRegistry>,
    approvals: Option<Arc<ApprovalStore>>,
    auth: Arc<AuthRuntime>,
    events: EventBus,
    hooks: Arc<dyn RunHooks>,
    settings: EngineSettings,
}

/// The run engine. Cheap to clone; all state is injected and shared.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub struct EngineBuilder {
    provider: Arc<dyn ModelProvider>,
    agents: Arc<AgentRegistry>,
    memory: Option<Arc<dyn MemoryProvider>>,
    auth: Option<Arc<AuthRuntime>>,
    events: EventBus,
    hooks: Arc<dyn RunHooks>,
    settings: EngineSettings,
}

impl Engine {
    pub fn builder(provider: Arc<dyn ModelProvider>, agents: Arc<AgentRegistry>) -> EngineBuilder {
        EngineBuilder {
            provider,
            agents,
            memory: None,
            auth: None,
            events: EventBus::new(),
            hooks: Arc::new(NoopHooks),
            settings: EngineSettings::default(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.inner.agents
    }

    pub fn auth(&self) -> &Arc<AuthRuntime> {
        &self.inner.auth
    }

    pub fn approvals(&self) -> Option<&Arc<ApprovalStore>> {
        self.inner.approvals.as_ref()
    }

    /// Run until Finish, Interrupt, or Error, resolving the agent from
    /// the registry by `state.current_agent`.
    pub async fn run(&self, state: RunState, cancel: CancellationToken) -> RunResult {
        let Some(agent) = self.inner.agents.get(&state.current_agent) else {
            let err = Error::UnknownAgent(state.current_agent.clone());
            return self
                .finish_error(state, err, TokenUsage::default(), std::time::Instant::now())
                .await;
        };
        self.run_with_agent(agent, state, cancel, None).await
    }

    /// Run against an explicit agent definition (used by sub-agent
    /// tools, which carry their own child definition and turn cap).
    pub async fn run_with_agent(
        &self,
        agent: Arc<AgentDef>,
        mut state: RunState,
        cancel: CancellationToken,
        max_turns_override: Option<u32>,
    ) -> RunResult {
        let started = std::time::Instant::now();
        let max_turns = max_turns_override
            .or(agent.max_turns)
            .unwrap_or(self.inner.settings.default_max_turns);

        self.inner.events.emit(RunEvent::RunStart {
            run_id: state.run_id.clone(),
            trace_id: state.trace_id.clone(),
            conversation_id: state.conversation_id.clone(),
            agent_name: agent.name.clone(),
        });
        fire_hook!(self.inner.hooks.on_run_start(&state), "on_run_start");

        // Snapshot persisted decisions once, before the first
        // transition. Decisions recorded after this point belong to
        // the next run.
        let persisted_approvals = match &self.inner.approvals {
            Some(store) => match store.entries(&state.conversation_id).await {
                Ok(entries) => entries,
                Err(e) => {
                    return self.finish_error(state, e, TokenUsage::default(), started).await
                }
            },
            None => HashMap::new(),
        };

        let mut usage = TokenUsage::default();

        loop {
            // ── Tool phase for any outstanding calls ──────────────
            if let Some(batch) = outstanding_batch(&state) {
                match self
                    .tool_phase(&agent, &mut state, &batch, &persisted_approvals, &cancel)
                    .await
                {
                    Phase::Done => {
                        state = state.next_turn();
                        if state.turn_count >= max_turns {
                            return self
                                .finish_error(
                                    state,
                                    Error::MaxTurnsExceeded(max_turns),
                                    usage,
                                    started,
                                )
                                .await;
                        }
                    }
                    Phase::Interrupted(interruptions) => {
                        return self
                            .finish_interrupted(state, interruptions, usage, started)
                            .await;
                    }
                    Phase::Fatal(err) => {
                        return self.finish_error(state, err, usage, started).await
                    }
                }
                continue;
            }

            // ── Model call ────────────────────────────────────────
            if cancel.is_cancelled() {
                return self.finish_error(state, Error::Cancelled, usage, started).await;
            }

            let request = ModelRequest {
                messages: request_messages(&agent, &state),
                tools: agent.tool_specs(),
                model: agent.model.clone(),
                temperature: None,
                max_tokens: None,
            };

            let response = tokio::select! {
                res = tokio::time::timeout(
                    self.inner.settings.model_timeout,
                    self.inner.provider.complete(&request),
                ) => match res {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => return self.finish_error(state, e, usage, started).await,
                    Err(_) => {
                        return self
                            .finish_error(
                                state,
                                Error::Timeout("model call timed out".into()),
                                usage,
                                started,
                            )
                            .await;
                    }
                },
                _ = cancel.cancelled() => {
                    return self.finish_error(state, Error::Cancelled, usage, started).await;
                }
            };

            if let Some(turn_usage) = &response.usage {
                usage.accumulate(turn_usage);
                self.inner.events.emit(RunEvent::TokenUsage {
                    prompt: turn_usage.prompt_tokens,
                    completion: turn_usage.completion_tokens,
                    total: turn_usage.total_tokens,
                });
                fire_hook!(self.inner.hooks.on_token_usage(turn_usage), "on_token_usage");
            }

            if response.is_empty() {
                return self
                    .finish_error(
                        state,
                        Error::ModelBehavior("completion had neither content nor tool calls".into()),
                        usage,
                        started,
                    )
                    .await;
            }

            let text = response.content.clone().unwrap_or_default();
            let message = if response.tool_calls.is_empty() {
                Message::assistant(text.clone())
            } else {
                Message::assistant_with_tools(response.content.clone(), response.tool_calls.clone())
            };
            state = state.with_message(message.clone());

            self.inner.events.emit(RunEvent::AssistantMessage {
                content: text.clone(),
                tool_calls: (!response.tool_calls.is_empty()).then(|| response.tool_calls.clone()),
                thinking: response.thinking.clone(),
            });
            fire_hook!(
                self.inner.hooks.on_assistant_message(&message),
                "on_assistant_message"
            );

            if response.tool_calls.is_empty() {
                return self.finish_completed(state, text, usage, started).await;
            }

            self.inner.events.emit(RunEvent::ToolCallsRequested {
                calls: response.tool_calls.iter().map(ToolCallSummary::from).collect(),
            });
            fire_hook!(
                self.inner.hooks.on_tool_calls(&response.tool_calls),
                "on_tool_calls"
            );
            // Loop back: the new calls are now the outstanding batch.
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Tool phase
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn tool_phase(
        &self,
        agent: &Arc<AgentDef>,
        state: &mut RunState,
        calls: &[ToolCall],
        persisted: &HashMap<String, ApprovalEntry>,
        cancel: &CancellationToken,
    ) -> Phase {
        // Apply persisted decisions to this batch. Explicit entries the
        // caller seeded win over rehydrated ones.
        for (id, entry) in rehydrate(calls, persisted) {
            state.approvals.entry(id).or_insert(entry);
        }

        if self.parallel_eligible(agent, state, calls) {
            return self.parallel_phase(agent, state, calls, cancel).await;
        }

        for (index, call) in calls.iter().enumerate() {
            if state.has_tool_result(&call.id) {
                continue;
            }
            if cancel.is_cancelled() {
                return Phase::Fatal(Error::Cancelled);
            }

            let Some(tool) = agent.tool(&call.name) else {
                self.synthesize_result(
                    state,
                    call,
                    serde_json::json!({
                        "error": "tool_not_found",
                        "message": format!("no tool named '{}'", call.name),
                    }),
                    true,
                );
                continue;
            };

            let args = match tool.parse_arguments(&call.arguments) {
                Ok(args) => args,
                Err(message) => {
                    self.synthesize_result(
                        state,
                        call,
                        serde_json::json!({ "code": CODE_INVALID_INPUT, "message": message }),
                        true,
                    );
                    continue;
                }
            };

            let mut ctx = self.tool_context(state, &call.id, cancel);

            // ── Approval gate ─────────────────────────────────────
            if tool.needs_approval(&args, &ctx) {
                match state.approvals.get(&call.id).map(|e| e.status) {
                    Some(ApprovalStatus::Approved) => {}
                    Some(ApprovalStatus::Rejected) => {
                        let reason = state
                            .approvals
                            .get(&call.id)
                            .and_then(|e| e.rejection_reason().map(String::from));
                        self.synthesize_result(
                            state,
                            call,
                            serde_json::json!({
                                "status": "approval_denied",
                                "rejection_reason": reason,
                            }),
                            false,
                        );
                        continue;
                    }
                    _ => {
                        let interruptions = self
                            .approval_interruptions(agent, state, &calls[index..], cancel)
                            .await;
                        return Phase::Interrupted(interruptions);
                    }
                }
            }

            // ── Auth gate ─────────────────────────────────────────
            if let Some(auth_cfg) = tool.auth() {
                match self
                    .inner
                    .auth
                    .acquire(&agent.name, tool.name(), &auth_cfg, &state.run_id, &call.id)
                    .await
                {
                    Ok(AuthDecision::Ready(credential)) => ctx.credential = Some(credential),
                    Ok(AuthDecision::Required {
                        auth_key,
                        authorization_url,
                        scopes,
                        scheme_type,
                    }) => {
                        return Phase::Interrupted(vec![Interruption::ToolAuth {
                            tool_call: call.clone(),
                            session_id: state.run_id.clone(),
                            auth_key,
                            authorization_url,
                            scopes,
                            scheme_type,
                        }]);
                    }
                    Err(e) => return Phase::Fatal(e),
                }
            }

            // ── Execute ───────────────────────────────────────────
            self.inner.events.emit(RunEvent::ToolPhase {
                tool_call_id: call.id.clone(),
                phase: ToolPhaseKind::Started,
                result: None,
                error: None,
            });

            match self.execute_with_limits(tool, args, ctx, cancel).await {
                Exec::Outcome(outcome) => {
                    if let Some(phase) = self.handle_outcome(agent, state, call, outcome).await {
                        return phase;
                    }
                }
                Exec::Cancelled { late } => {
                    // The grace window let the tool finish; keep its
                    // result for the audit trail. Otherwise discard
                    // and synthesize.
                    match late {
                        Some(ToolOutcome::Ok(value)) => {
                            let content = stringify(value);
                            state.messages.push(Message::tool_result(&call.id, &content));
                            self.emit_tool_done(call, &content, false);
                        }
                        _ => {
                            self.synthesize_result(
                                state,
                                call,
                                serde_json::json!({ "error": "cancelled" }),
                                true,
                            );
                        }
                    }
                    return Phase::Fatal(Error::Cancelled);
                }
            }
        }

        Phase::Done
    }

    /// Apply one non-cancelled tool outcome; `Some(phase)` short-
    /// circuits the batch.
    async fn handle_outcome(
        &self,
        agent: &Arc<AgentDef>,
        state: &mut RunState,
        call: &ToolCall,
        outcome: ToolOutcome,
    ) -> Option<Phase> {
        match outcome {
            ToolOutcome::Ok(value) => {
                let content = stringify(value);
                state.messages.push(Message::tool_result(&call.id, &content));
                self.emit_tool_done(call, &content, false);
                fire_hook!(
                    self.inner.hooks.on_tool_result(call, &content),
                    "on_tool_result"
                );
                None
            }
            ToolOutcome::AuthRequired(auth_cfg) => {
                // The tool reported a missing credential mid-flight;
                // run the ladder to mint the challenge and suspend.
                let interruption = match self
                    .inner
                    .auth
                    .acquire(&agent.name, &call.name, &auth_cfg, &state.run_id, &call.id)
                    .await
                {
                    Ok(AuthDecision::Required {
                        auth_key,
                        authorization_url,
                        scopes,
                        scheme_type,
                    }) => Interruption::ToolAuth {
                        tool_call: call.clone(),
                        session_id: state.run_id.clone(),
                        auth_key,
                        authorization_url,
                        scopes,
                        scheme_type,
                    },
                    Ok(AuthDecision::Ready(_)) => Interruption::ToolAuth {
                        tool_call: call.clone(),
                        session_id: state.run_id.clone(),
                        auth_key: self.inner.auth.auth_key(&agent.name, &call.name, &auth_cfg),
                        authorization_url: None,
                        scopes: auth_cfg.scheme.scopes(),
                        scheme_type: auth_cfg.scheme.scheme_type().to_string(),
                    },
                    Err(e) => return Some(Phase::Fatal(e)),
                };
                Some(Phase::Interrupted(vec![interruption]))
            }
            ToolOutcome::Clarification { question, options } => {
                Some(Phase::Interrupted(vec![Interruption::ClarificationRequired {
                    tool_call: call.clone(),
                    session_id: state.run_id.clone(),
                    question,
                    options,
                }]))
            }
            ToolOutcome::Failed { code, message } => {
                self.synthesize_result(
                    state,
                    call,
                    serde_json::json!({ "code": code, "message": message }),
                    true,
                );
                None
            }
            ToolOutcome::Interrupted(interruptions) => Some(Phase::Interrupted(interruptions)),
        }
    }

    /// Concurrent batch path: declaration order is preserved in the
    /// transcript because results are collected positionally.
    async fn parallel_phase(
        &self,
        agent: &Arc<AgentDef>,
        state: &mut RunState,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Phase {
        let mut prepared = Vec::with_capacity(calls.len());
        for call in calls {
            // parallel_eligible already proved these succeed.
            let Some(tool) = agent.tool(&call.name) else {
                return Phase::Fatal(Error::Other("parallel batch lost a tool".into()));
            };
            let Ok(args) = tool.parse_arguments(&call.arguments) else {
                return Phase::Fatal(Error::Other("parallel batch lost its arguments".into()));
            };
            self.inner.events.emit(RunEvent::ToolPhase {
                tool_call_id: call.id.clone(),
                phase: ToolPhaseKind::Started,
                result: None,
                error: None,
            });
            prepared.push((call, tool, args, self.tool_context(state, &call.id, cancel)));
        }

        let futures: Vec<_> = prepared
            .iter()
            .map(|(_, tool, args, ctx)| {
                self.execute_with_limits(tool.clone(), args.clone(), ctx.clone(), cancel)
            })
            .collect();
        let results = join_all(futures).await;

        for ((call, ..), exec) in prepared.iter().zip(results) {
            let call: &ToolCall = call;
            match exec {
                Exec::Outcome(outcome) => {
                    if let Some(phase) = self.handle_outcome(agent, state, call, outcome).await {
                        return phase;
                    }
                }
                Exec::Cancelled { late } => {
                    match late {
                        Some(ToolOutcome::Ok(value)) => {
                            let content = stringify(value);
                            state.messages.push(Message::tool_result(&call.id, &content));
                            self.emit_tool_done(call, &content, false);
                        }
                        _ => self.synthesize_result(
                            state,
                            call,
                            serde_json::json!({ "error": "cancelled" }),
                            true,
                        ),
                    }
                    return Phase::Fatal(Error::Cancelled);
                }
            }
        }

        Phase::Done
    }

    /// The concurrent path is taken only when every pending call in the
    /// batch is plain: declared independent, decodable, no approval, no
    /// auth. Anything else falls back to the sequential path.
    fn parallel_eligible(
        &self,
        agent: &Arc<AgentDef>,
        state: &RunState,
        calls: &[ToolCall],
    ) -> bool {
        if calls.len() < 2 {
            return false;
        }
        calls.iter().all(|call| {
            if state.has_tool_result(&call.id) {
                return false;
            }
            let Some(tool) = agent.tool(&call.name) else {
                return false;
            };
            if !tool.independent() || tool.auth().is_some() {
                return false;
            }
            let Ok(args) = tool.parse_arguments(&call.arguments) else {
                return false;
            };
            let ctx = self.tool_context(state, &call.id, &CancellationToken::new());
            !tool.needs_approval(&args, &ctx)
        })
    }

    /// Collect the interruption set for an undecided batch: the
    /// triggering call plus every later undecided approval-required
    /// call of the same assistant message. Pending entries are
    /// persisted for the audit trail (write path, log-and-swallow).
    async fn approval_interruptions(
        &self,
        agent: &Arc<AgentDef>,
        state: &mut RunState,
        remaining: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<Interruption> {
        let mut interruptions = Vec::new();
        for call in remaining {
            if state.has_tool_result(&call.id) {
                continue;
            }
            let Some(tool) = agent.tool(&call.name) else {
                continue;
            };
            let Ok(args) = tool.parse_arguments(&call.arguments) else {
                continue;
            };
            let ctx = self.tool_context(state, &call.id, cancel);
            if !tool.needs_approval(&args, &ctx) {
                continue;
            }
            let decided = matches!(
                state.approvals.get(&call.id).map(|e| e.status),
                Some(ApprovalStatus::Approved) | Some(ApprovalStatus::Rejected)
            );
            if decided {
                continue;
            }

            let signature = tool_call_signature(call);
            let mut entry = ApprovalEntry::new(ApprovalStatus::Pending);
            entry.tool_call_id = Some(call.id.clone());
            entry.tool_name = Some(call.name.clone());
            entry.signature = Some(signature.clone());
            state.approvals.insert(call.id.clone(), entry.clone());

            if let Some(store) = &self.inner.approvals {
                if let Err(e) = store
                    .record(&state.conversation_id, &state.run_id, &call.id, entry)
                    .await
                {
                    tracing::warn!(
                        conversation_id = %state.conversation_id,
                        tool_call_id = %call.id,
                        error = %e,
                        "failed to persist pending approval"
                    );
                }
            }

            self.inner.events.emit(RunEvent::ApprovalRequired {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                args,
                signature: signature.clone(),
            });
            interruptions.push(Interruption::ToolApproval {
                tool_call: call.clone(),
                session_id: state.run_id.clone(),
                signature,
            });
        }
        interruptions
    }

    async fn execute_with_limits(
        &self,
        tool: Arc<dyn Tool>,
        args: Value,
        ctx: ToolContext,
        cancel: &CancellationToken,
    ) -> Exec {
        let tool_timeout = self.inner.settings.tool_timeout;
        let fut = async move {
            match tool_timeout {
                Some(limit) => match tokio::time::timeout(limit, tool.execute(args, &ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ToolOutcome::Failed {
                        code: CODE_EXECUTION_FAILED.into(),
                        message: "tool execution timed out".into(),
                    },
                },
                None => tool.execute(args, &ctx).await,
            }
        };
        tokio::pin!(fut);

        tokio::select! {
            outcome = &mut fut => Exec::Outcome(outcome),
            _ = cancel.cancelled() => {
                match tokio::time::timeout(self.inner.settings.cancel_grace, &mut fut).await {
                    Ok(outcome) => Exec::Cancelled { late: Some(outcome) },
                    Err(_) => Exec::Cancelled { late: None },
                }
            }
        }
    }

    fn tool_context(
        &self,
        state: &RunState,
        tool_call_id: &str,
        cancel: &CancellationToken,
    ) -> ToolContext {
        ToolContext {
            context: state.context.clone(),
            run_id: state.run_id.clone(),
            conversation_id: state.conversation_id.clone(),
            agent_name: state.current_agent.clone(),
            tool_call_id: tool_call_id.to_owned(),
            credential: None,
            approval_context: state
                .approvals
                .get(tool_call_id)
                .and_then(|e| e.additional_context.clone()),
            auth: self.inner.auth.clone(),
            cancel: cancel.child_token(),
            events: self.inner.events.clone(),
            engine: Some(self.clone()),
        }
    }

    /// Append a synthesized tool message and emit the matching phase
    /// events.
    fn synthesize_result(&self, state: &mut RunState, call: &ToolCall, payload: Value, failed: bool) {
        let content = payload.to_string();
        self.inner.events.emit(RunEvent::ToolPhase {
            tool_call_id: call.id.clone(),
            phase: ToolPhaseKind::Started,
            result: None,
            error: None,
        });
        state.messages.push(Message::tool_result(&call.id, &content));
        if failed {
            self.inner.events.emit(RunEvent::ToolPhase {
                tool_call_id: call.id.clone(),
                phase: ToolPhaseKind::Failed,
                result: None,
                error: Some(content),
            });
        } else {
            self.emit_tool_done(call, &content, false);
        }
    }

    fn emit_tool_done(&self, call: &ToolCall, content: &str, failed: bool) {
        self.inner.events.emit(RunEvent::ToolPhase {
            tool_call_id: call.id.clone(),
            phase: if failed {
                ToolPhaseKind::Failed
            } else {
                ToolPhaseKind::Completed
            },
            result: (!failed).then(|| content.to_owned()),
            error: failed.then(|| content.to_owned()),
        });
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Terminal transitions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn finish_completed(
        &self,
        state: RunState,
        output: String,
        usage: TokenUsage,
        started: std::time::Instant,
    ) -> RunResult {
        let outcome = RunOutcome::Completed { output };
        self.finish(state, outcome, usage, started).await
    }

    async fn finish_interrupted(
        &self,
        state: RunState,
        interruptions: Vec<Interruption>,
        usage: TokenUsage,
        started: std::time::Instant,
    ) -> RunResult {
        let outcome = RunOutcome::Interrupted { interruptions };
        self.finish(state, outcome, usage, started).await
    }

    async fn finish_error(
        &self,
        state: RunState,
        error: Error,
        usage: TokenUsage,
        started: std::time::Instant,
    ) -> RunResult {
        let kind = error.kind();
        self.inner.events.emit(RunEvent::Error {
            message: error.to_string(),
            kind: kind_str(kind).to_owned(),
        });
        fire_hook!(self.inner.hooks.on_error(&error), "on_error");
        let outcome = RunOutcome::error(kind, error.to_string());
        self.finish(state, outcome, usage, started).await
    }

    async fn finish(
        &self,
        state: RunState,
        outcome: RunOutcome,
        usage: TokenUsage,
        started: std::time::Instant,
    ) -> RunResult {
        self.inner.events.emit(RunEvent::RunEnd {
            outcome: outcome.clone(),
        });
        fire_hook!(self.inner.hooks.on_run_end(&outcome), "on_run_end");

        let dropped = self.inner.events.dropped_total();
        if dropped > 0 {
            tracing::warn!(dropped, run_id = %state.run_id, "event sinks dropped events");
        }

        RunResult {
            state,
            outcome,
            usage,
            execution_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

impl EngineBuilder {
    pub fn memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn auth(mut self, auth: Arc<AuthRuntime>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn sink(self, sink: Arc<dyn EventSink>) -> Self {
        self.events.subscribe(sink);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> tiller_domain::Result<Engine> {
        let auth = match self.auth {
            Some(auth) => auth,
            None => Arc::new(AuthRuntime::new(
                AuthStore::new(Arc::new(InMemoryKv::new())),
                Arc::new(HttpTokenExchanger::new()?),
            )),
        };
        let approvals = self.memory.map(|m| Arc::new(ApprovalStore::new(m)));
        Ok(Engine {
            inner: Arc::new(EngineInner {
                provider: self.provider,
                agents: self.agents,
                approvals,
                auth,
                events: self.events,
                hooks: self.hooks,
                settings: self.settings,
            }),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Phase {
    Done,
    Interrupted(Vec<Interruption>),
    Fatal(Error),
}

enum Exec {
    Outcome(ToolOutcome),
    Cancelled { late: Option<ToolOutcome> },
}

/// The most recent assistant tool batch with at least one missing
/// result, if any. This drives both fresh batches and resumed ones.
fn outstanding_batch(state: &RunState) -> Option<Vec<ToolCall>> {
    let message = state.last_assistant_with_tools()?;
    let calls = message.tool_calls.as_ref()?;
    calls
        .iter()
        .any(|c| !state.has_tool_result(&c.id))
        .then(|| calls.clone())
}

/// The agent's instructions ride along as a leading system message on
/// every request; they are not part of the persisted transcript.
fn request_messages(agent: &AgentDef, state: &RunState) -> Vec<Message> {
    let mut messages = Vec::with_capacity(state.messages.len() + 1);
    if !agent.instructions.is_empty() {
        messages.push(Message::system(agent.instructions.clone()));
    }
    messages.extend(state.messages.iter().cloned());
    messages
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn kind_str(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::ModelError => "model_error",
        ErrorKind::ModelBehavior => "model_behavior",
        ErrorKind::MaxTurnsExceeded => "max_turns_exceeded",
        ErrorKind::Cancelled => "cancelled",
        ErrorKind::Store => "store",
        ErrorKind::Internal => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outstanding_batch_requires_missing_results() {
        let calls = vec![
            ToolCall {
                id: "tc-1".into(),
                name: "t".into(),
                arguments: "{}".into(),
            },
            ToolCall {
                id: "tc-2".into(),
                name: "t".into(),
                arguments: "{}".into(),
            },
        ];
        let state = RunState::new("a", "c")
            .with_message(Message::assistant_with_tools(None, calls.clone()));
        assert_eq!(outstanding_batch(&state).unwrap().len(), 2);

        let state = state.with_message(Message::tool_result("tc-1", "ok"));
        assert_eq!(outstanding_batch(&state).unwrap().len(), 2);

        let state = state.with_message(Message::tool_result("tc-2", "ok"));
        assert!(outstanding_batch(&state).is_none());
    }

    #[test]
    fn request_messages_prepends_instructions() {
        let agent = AgentDef::new("a", "Be helpful.");
        let state = RunState::new("a", "c").with_message(Message::user("hi"));
        let messages = request_messages(&agent, &state);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].role, tiller_domain::Role::System));
    }

    #[test]
    fn request_messages_without_instructions() {
        let agent = AgentDef::new("a", "");
        let state = RunState::new("a", "c").with_message(Message::user("hi"));
        assert_eq!(request_messages(&agent, &state).len(), 1);
    }

    #[test]
    fn stringify_passes_strings_through() {
        assert_eq!(stringify(Value::String("ok:42".into())), "ok:42");
        assert_eq!(
            stringify(serde_json::json!({"a": 1})),
            r#"{"a":1}"#
        );
    }
}
