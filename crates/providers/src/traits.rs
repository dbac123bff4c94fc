//! Provider-agnostic request/response types and the core trait.

use serde::{Deserialize, Serialize};

use tiller_domain::{Message, Result, ToolCall};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wire-level tool definition exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A provider-agnostic completion request.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    /// Model identifier override. `None` uses the provider default.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Token usage for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A provider-agnostic completion response.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    /// Textual content; `None` when the model only emitted tool calls.
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Reasoning content, when the provider surfaces it.
    pub thinking: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: String,
    pub finish_reason: Option<String>,
}

impl ModelResponse {
    /// A response with neither content nor tool calls is a protocol
    /// violation the engine reports as `model_behavior`.
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty() && self.content.as_deref().map_or(true, |c| c.trim().is_empty())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every model adapter implements.
///
/// Implementations translate between the internal types and the wire
/// format of a specific gateway. The engine owns timeout and
/// cancellation; adapters just perform one call.
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send one completion request and wait for the full response.
    async fn complete(&self, req: &ModelRequest) -> Result<ModelResponse>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_detection() {
        let mut resp = ModelResponse::default();
        assert!(resp.is_empty());

        resp.content = Some("   ".into());
        assert!(resp.is_empty());

        resp.content = Some("hi".into());
        assert!(!resp.is_empty());

        let resp = ModelResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: "tc".into(),
                name: "t".into(),
                arguments: "{}".into(),
            }],
            ..Default::default()
        };
        assert!(!resp.is_empty());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        total.accumulate(&TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.prompt_tokens, 11);
        assert_eq!(total.completion_tokens, 7);
        assert_eq!(total.total_tokens, 18);
    }
}
