//! The Tiller run engine.
//!
//! Orchestrates one agent turn loop at a time: call the model, route
//! the response, execute tools (with approvals, auth, cancellation),
//! and loop until a terminal message, the turn cap, an interruption,
//! or an error. Everything the engine touches is injected: the model
//! provider, the agent registry, memory, the auth runtime, event
//! sinks, and hooks.

pub mod approval;
pub mod auth;
pub mod events;
pub mod hooks;
pub mod registry;
pub mod run;
pub mod subagent;
pub mod tool;

pub use approval::{rehydrate, ApprovalStore};
pub use auth::{
    derive_auth_key, AppliedCredential, AuthConfig, AuthDecision, AuthRuntime, AuthScheme,
    AuthStore, ExchangedCredential, HttpTokenExchanger, OAuth2Scheme, TokenExchanger,
};
pub use events::{ChannelSink, CollectingSink, EventBus, EventSink, RunEvent, ToolPhaseKind};
pub use hooks::{NoopHooks, RunHooks};
pub use registry::{AgentDef, AgentRegistry};
pub use run::{Engine, EngineBuilder, EngineSettings, RunResult};
pub use subagent::SubAgentTool;
pub use tool::{Tool, ToolContext, ToolOutcome};
