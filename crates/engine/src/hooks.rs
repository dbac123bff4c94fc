//! Run lifecycle hooks.
//!
//! Hooks are advisory observers. Every invocation is fallible and
//! isolated: the engine logs a failed hook and moves on; a hook can
//! never change a run's outcome.

use async_trait::async_trait;

use tiller_domain::{Error, Message, Result, RunOutcome, RunState, ToolCall};
use tiller_providers::TokenUsage;

#[async_trait]
pub trait RunHooks: Send + Sync {
    async fn on_run_start(&self, _state: &RunState) -> Result<()> {
        Ok(())
    }

    async fn on_assistant_message(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    async fn on_tool_calls(&self, _calls: &[ToolCall]) -> Result<()> {
        Ok(())
    }

    async fn on_tool_result(&self, _call: &ToolCall, _content: &str) -> Result<()> {
        Ok(())
    }

    async fn on_token_usage(&self, _usage: &TokenUsage) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, _error: &Error) -> Result<()> {
        Ok(())
    }

    async fn on_run_end(&self, _outcome: &RunOutcome) -> Result<()> {
        Ok(())
    }
}

/// The default: observes nothing.
pub struct NoopHooks;

#[async_trait]
impl RunHooks for NoopHooks {}

/// Log-and-swallow wrapper used at every hook call site.
macro_rules! fire_hook {
    ($call:expr, $name:literal) => {
        if let Err(e) = $call.await {
            tracing::warn!(hook = $name, error = %e, "hook failed; ignored");
        }
    };
}

pub(crate) use fire_hook;
