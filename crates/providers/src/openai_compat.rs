//! OpenAI-compatible adapter.
//!
//! Works with any endpoint that follows the OpenAI chat completions
//! contract (OpenAI, Azure-compatible gateways, vLLM, LM Studio,
//! Together). Non-streaming: the engine consumes whole completions.

use serde_json::Value;

use tiller_domain::{Error, Message, MessageContent, Result, Role, ToolCall};

use crate::traits::{ModelProvider, ModelRequest, ModelResponse, TokenUsage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let base_url: String = base_url.into();
        Ok(Self {
            id: id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            client,
        })
    }

    fn effective_model(&self, req: &ModelRequest) -> String {
        req.model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn build_body(&self, req: &ModelRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        body
    }
}

#[async_trait::async_trait]
impl ModelProvider for OpenAiCompatProvider {
    async fn complete(&self, req: &ModelRequest) -> Result<ModelResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(req);

        tracing::debug!(provider = %self.id, url = %url, "chat completions request");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let resp = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Model(e.to_string()))?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(|e| Error::Model(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Model(format!(
                "{}: HTTP {} - {}",
                self.id,
                status.as_u16(),
                resp_text
            )));
        }

        let resp_json: Value = serde_json::from_str(&resp_text)
            .map_err(|e| Error::Model(format!("{}: malformed completion: {e}", self.id)))?;
        parse_chat_response(&resp_json)
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    let mut out = serde_json::json!({
        "role": role_str(msg.role),
    });

    match &msg.content {
        MessageContent::Text(t) => {
            out["content"] = Value::String(t.clone());
        }
        MessageContent::Parts(_) => {
            // Text parts flatten; rich parts go out as text references.
            out["content"] = Value::String(msg.text_content());
        }
    }

    if let Some(calls) = &msg.tool_calls {
        let wire: Vec<Value> = calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.arguments,
                    }
                })
            })
            .collect();
        out["tool_calls"] = Value::Array(wire);
    }

    if let Some(id) = &msg.tool_call_id {
        out["tool_call_id"] = Value::String(id.clone());
    }

    out
}

fn parse_chat_response(json: &Value) -> Result<ModelResponse> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| Error::Model("completion has no choices".into()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| Error::Model("choice has no message".into()))?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .map(String::from);
    let thinking = message
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .map(String::from);

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let arguments = func
                        .get("arguments")
                        .and_then(|a| a.as_str())
                        .unwrap_or("{}")
                        .to_string();
                    Some(ToolCall { id, name, arguments })
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = json.get("usage").map(|u| TokenUsage {
        prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        completion_tokens: u
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
    });

    Ok(ModelResponse {
        content,
        tool_calls,
        thinking,
        usage,
        model: json
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_round_trip_to_wire() {
        let msg = Message::assistant_with_tools(
            Some("working on it".into()),
            vec![ToolCall {
                id: "tc-1".into(),
                name: "lookup".into(),
                arguments: r#"{"q":"x"}"#.into(),
            }],
        );
        let wire = msg_to_openai(&msg);
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["id"], "tc-1");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], r#"{"q":"x"}"#);
    }

    #[test]
    fn tool_result_carries_call_id() {
        let wire = msg_to_openai(&Message::tool_result("tc-7", "42"));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "tc-7");
        assert_eq!(wire["content"], "42");
    }

    #[test]
    fn parse_text_completion() {
        let json = serde_json::json!({
            "model": "gpt-4o-mini",
            "choices": [{
                "message": { "role": "assistant", "content": "hello" },
                "finish_reason": "stop",
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 },
        });
        let resp = parse_chat_response(&json).unwrap();
        assert_eq!(resp.content.as_deref(), Some("hello"));
        assert!(resp.tool_calls.is_empty());
        assert_eq!(resp.usage.unwrap().total_tokens, 15);
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn parse_tool_call_completion() {
        let json = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": { "name": "search", "arguments": "{\"q\":\"rust\"}" },
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let resp = parse_chat_response(&json).unwrap();
        assert!(resp.content.is_none());
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "search");
    }

    #[test]
    fn parse_rejects_empty_choices() {
        let json = serde_json::json!({ "choices": [] });
        assert!(parse_chat_response(&json).is_err());
    }
}
