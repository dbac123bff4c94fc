//! The tool contract.
//!
//! Tools return a [`ToolOutcome`] tag instead of raising: the engine
//! switches on the tag, so auth challenges and clarifications are
//! ordinary values, not non-local jumps.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::auth::{AppliedCredential, AuthConfig, AuthRuntime};
use crate::events::{EventBus, RunEvent};
use crate::run::Engine;

use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const CODE_EXECUTION_FAILED: &str = "EXECUTION_FAILED";
pub const CODE_INVALID_INPUT: &str = "INVALID_INPUT";

/// What one tool execution produced.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// Success; strings pass through, other values are stringified.
    Ok(Value),
    /// The tool needs a credential the runtime does not hold.
    AuthRequired(AuthConfig),
    /// The tool needs an answer from the user before it can proceed.
    Clarification {
        question: String,
        options: Vec<String>,
    },
    /// Execution failed; folded into the transcript, never fatal.
    Failed { code: String, message: String },
    /// A nested run suspended; the parent surfaces its interruptions.
    Interrupted(Vec<tiller_domain::Interruption>),
}

impl ToolOutcome {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Ok(Value::String(value.into()))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            code: CODE_EXECUTION_FAILED.into(),
            message: message.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a tool executor gets handed for one invocation.
#[derive(Clone)]
pub struct ToolContext {
    /// Caller-supplied opaque value, passed through unchanged.
    pub context: Value,
    pub run_id: String,
    pub conversation_id: String,
    pub agent_name: String,
    pub tool_call_id: String,
    /// Credential resolved by the auth runtime, when the tool declared
    /// an auth requirement and acquisition succeeded.
    pub credential: Option<AppliedCredential>,
    /// Additional context from this call's approval entry — carries
    /// clarification answers and reviewer notes across a resume.
    pub approval_context: Option<Value>,
    pub auth: Arc<AuthRuntime>,
    pub cancel: CancellationToken,
    pub(crate) events: EventBus,
    pub(crate) engine: Option<Engine>,
}

impl ToolContext {
    /// The engine handle, for tools that start nested runs.
    pub fn engine(&self) -> Option<Engine> {
        self.engine.clone()
    }

    pub fn emit_progress(&self, message: impl Into<String>, progress: Option<f32>) {
        self.events.emit(RunEvent::ToolProgressUpdate {
            tool_call_id: self.tool_call_id.clone(),
            message: message.into(),
            progress,
        });
    }

    pub fn emit_partial(&self, data: Value) {
        self.events.emit(RunEvent::ToolPartialResult {
            tool_call_id: self.tool_call_id.clone(),
            data,
        });
    }

    pub fn emit_chunk(&self, chunk: impl Into<String>) {
        self.events.emit(RunEvent::ToolStreamingOutput {
            tool_call_id: self.tool_call_id.clone(),
            chunk: chunk.into(),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A callable unit exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema for the arguments.
    fn parameters(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    /// Advisory: safe to execute concurrently with other independent
    /// tools in the same batch.
    fn independent(&self) -> bool {
        false
    }

    /// Auth requirement, if any; the engine acquires before execution.
    fn auth(&self) -> Option<AuthConfig> {
        None
    }

    /// Whether this invocation must be approved by a human first.
    fn needs_approval(&self, _args: &Value, _ctx: &ToolContext) -> bool {
        false
    }

    /// Parse the raw argument string. The default decodes JSON and
    /// checks it against `parameters()` (required keys, primitive
    /// types). Errors surface as `INVALID_INPUT` tool messages.
    fn parse_arguments(&self, raw: &str) -> std::result::Result<Value, String> {
        let trimmed = raw.trim();
        let value: Value = if trimmed.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(trimmed).map_err(|e| format!("arguments are not valid JSON: {e}"))?
        };
        validate_against_schema(&self.parameters(), &value)?;
        Ok(value)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema-lite validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Minimal JSON-Schema check: top-level `required` keys exist and
/// declared property types match.
pub fn validate_against_schema(schema: &Value, value: &Value) -> std::result::Result<(), String> {
    let Some(obj) = value.as_object() else {
        return Err("arguments must be a JSON object".into());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(format!("missing required argument: {key}"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, spec) in props {
            let Some(actual) = obj.get(key) else { continue };
            let Some(expected) = spec.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            if !type_matches(expected, actual) {
                return Err(format!("argument '{key}' must be of type {expected}"));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, actual: &Value) -> bool {
    match expected {
        "string" => actual.is_string(),
        "number" => actual.is_number(),
        "integer" => actual.is_i64() || actual.is_u64(),
        "boolean" => actual.is_boolean(),
        "array" => actual.is_array(),
        "object" => actual.is_object(),
        "null" => actual.is_null(),
        _ => true,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "times": { "type": "integer" },
                },
                "required": ["text"],
            })
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolOutcome {
            ToolOutcome::text(args["text"].as_str().unwrap_or_default())
        }
    }

    #[test]
    fn parse_valid_arguments() {
        let tool = EchoTool;
        let args = tool.parse_arguments(r#"{"text":"hi","times":2}"#).unwrap();
        assert_eq!(args["text"], "hi");
    }

    #[test]
    fn parse_rejects_missing_required() {
        let tool = EchoTool;
        let err = tool.parse_arguments(r#"{"times":2}"#).unwrap_err();
        assert!(err.contains("text"));
    }

    #[test]
    fn parse_rejects_wrong_type() {
        let tool = EchoTool;
        let err = tool.parse_arguments(r#"{"text":"hi","times":"two"}"#).unwrap_err();
        assert!(err.contains("times"));
    }

    #[test]
    fn parse_rejects_garbage() {
        let tool = EchoTool;
        assert!(tool.parse_arguments("not json").is_err());
        assert!(tool.parse_arguments("[1,2]").is_err());
    }

    #[test]
    fn empty_arguments_default_to_object() {
        struct NoArgs;
        #[async_trait]
        impl Tool for NoArgs {
            fn name(&self) -> &str {
                "noargs"
            }
            async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolOutcome {
                ToolOutcome::text("ok")
            }
        }
        let args = NoArgs.parse_arguments("").unwrap();
        assert!(args.as_object().unwrap().is_empty());
    }

    #[test]
    fn schema_extra_keys_pass() {
        let tool = EchoTool;
        assert!(tool.parse_arguments(r#"{"text":"hi","unknown":true}"#).is_ok());
    }
}
