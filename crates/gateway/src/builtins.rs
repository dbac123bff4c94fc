//! Built-in tools the config can hand to agents by name.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tiller_engine::{Tool, ToolContext, ToolOutcome};

/// Resolve a built-in tool by its config name.
pub fn resolve(name: &str) -> Option<Arc<dyn Tool>> {
    match name {
        "clock" => Some(Arc::new(Clock)),
        "echo" => Some(Arc::new(Echo)),
        "http.get" => Some(Arc::new(HttpGet::new())),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// clock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Clock;

#[async_trait]
impl Tool for Clock {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Current UTC date and time."
    }

    fn independent(&self) -> bool {
        true
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolOutcome {
        ToolOutcome::text(chrono::Utc::now().to_rfc3339())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// echo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Echo;

#[async_trait]
impl Tool for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        })
    }

    fn independent(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolOutcome {
        ToolOutcome::text(args["text"].as_str().unwrap_or_default())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// http.get
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_BODY_CHARS: usize = 8_192;

/// Outbound GET. Fetching arbitrary URLs on a user's behalf is gated
/// behind human approval.
struct HttpGet {
    client: reqwest::Client,
}

impl HttpGet {
    fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Tool for HttpGet {
    fn name(&self) -> &str {
        "http.get"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP GET and return status plus body."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "http(s) URL to fetch" }
            },
            "required": ["url"]
        })
    }

    fn needs_approval(&self, _args: &Value, _ctx: &ToolContext) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let url = args["url"].as_str().unwrap_or_default();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolOutcome::Failed {
                code: tiller_engine::tool::CODE_INVALID_INPUT.into(),
                message: "url must use http or https".into(),
            };
        }

        let mut request = self.client.get(url);
        if let Some(cred) = &ctx.credential {
            request = request.header(cred.header.as_str(), cred.value.as_str());
        }

        match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                let body = if body.len() > MAX_BODY_CHARS {
                    let mut end = MAX_BODY_CHARS;
                    while !body.is_char_boundary(end) {
                        end -= 1;
                    }
                    format!("{}…", &body[..end])
                } else {
                    body
                };
                ToolOutcome::text(format!("{status} {body}"))
            }
            Err(e) => ToolOutcome::failed(format!("request failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_builtins() {
        for name in ["clock", "echo", "http.get"] {
            assert!(resolve(name).is_some(), "missing builtin {name}");
        }
        assert!(resolve("nope").is_none());
    }

    #[test]
    fn echo_schema_requires_text() {
        let echo = resolve("echo").unwrap();
        assert!(echo.parse_arguments(r#"{"text":"hi"}"#).is_ok());
        assert!(echo.parse_arguments("{}").is_err());
    }
}
