//! A child agent exposed as a callable tool.
//!
//! The executor starts a nested run: fresh run id, fresh messages
//! seeded from the input, the parent's context and conversation. The
//! parent task is suspended inside the tool execution until the child
//! terminates; a suspended child propagates its interruptions outward
//! as the parent's own interrupt.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tiller_domain::{RunOutcome, RunState};

use crate::registry::AgentDef;
use crate::run::RunResult;
use crate::tool::{Tool, ToolContext, ToolOutcome, CODE_EXECUTION_FAILED};

type OutputExtractor = dyn Fn(&RunResult) -> String + Send + Sync;

pub struct SubAgentTool {
    name: String,
    description: String,
    child: Arc<AgentDef>,
    parameters: Value,
    max_turns: Option<u32>,
    output_extractor: Option<Arc<OutputExtractor>>,
}

impl SubAgentTool {
    pub fn new(name: impl Into<String>, child: Arc<AgentDef>) -> Self {
        let child_name = child.name.clone();
        Self {
            name: name.into(),
            description: format!("Delegate a task to the '{child_name}' agent."),
            child,
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "input": { "type": "string", "description": "Task for the agent" }
                },
                "required": ["input"]
            }),
            max_turns: None,
            output_extractor: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Replace the default `{input: string}` schema.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    /// Derive the tool result from the child's full run result instead
    /// of its final text.
    pub fn with_output_extractor(
        mut self,
        extractor: impl Fn(&RunResult) -> String + Send + Sync + 'static,
    ) -> Self {
        self.output_extractor = Some(Arc::new(extractor));
        self
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(engine) = ctx.engine() else {
            return ToolOutcome::Failed {
                code: CODE_EXECUTION_FAILED.into(),
                message: "sub-agent tool invoked outside an engine run".into(),
            };
        };

        let input = args
            .get("input")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| args.to_string());

        let child_state = RunState::new(self.child.name.clone(), ctx.conversation_id.clone())
            .with_context(ctx.context.clone())
            .with_message(tiller_domain::Message::user(input));

        tracing::debug!(
            parent = %ctx.agent_name,
            child = %self.child.name,
            "starting nested run"
        );

        let result = engine
            .run_with_agent(
                self.child.clone(),
                child_state,
                ctx.cancel.child_token(),
                self.max_turns,
            )
            .await;

        match &result.outcome {
            RunOutcome::Completed { output } => {
                let text = match &self.output_extractor {
                    Some(extract) => extract(&result),
                    None => output.clone(),
                };
                ToolOutcome::Ok(Value::String(text))
            }
            RunOutcome::Interrupted { interruptions } => {
                ToolOutcome::Interrupted(interruptions.clone())
            }
            RunOutcome::Error { error, message } => ToolOutcome::Failed {
                code: CODE_EXECUTION_FAILED.into(),
                message: format!(
                    "sub-agent '{}' failed: {:?}{}",
                    self.child.name,
                    error,
                    message
                        .as_deref()
                        .map(|m| format!(" ({m})"))
                        .unwrap_or_default()
                ),
            },
        }
    }
}
