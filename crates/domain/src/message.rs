//! Conversation messages (provider-agnostic).
//!
//! A [`Message`] is a tagged record over the four roles. Assistant
//! messages may carry tool calls; tool messages must reference the
//! call they answer. Content is either a plain string or an ordered
//! sequence of parts (text, image refs, file refs).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum decoded size for inline (base64) attachment data.
pub const MAX_INLINE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum filename length for file parts and attachments.
pub const MAX_FILENAME_LEN: usize = 255;

const ALLOWED_SCHEMES: [&str; 3] = ["http", "https", "data"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles and tool calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation emitted by the model.
///
/// `id` is provider-assigned per assistant message and is **not**
/// stable across re-emissions; decisions that must survive id churn
/// are matched by signature instead (see [`crate::signature`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument string, exactly as the provider emitted it.
    pub arguments: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Inline base64 payload (alternative to `url`).
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    File {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

/// An out-of-band attachment carried alongside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Tool invocations; assistant messages only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// The tool call this message answers; tool messages only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::bare(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::bare(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, text)
    }

    /// Assistant message carrying tool calls (and optional leading text).
    pub fn assistant_with_tools(text: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.unwrap_or_default()),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            attachments: Vec::new(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            attachments: Vec::new(),
        }
    }

    fn bare(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: None,
            attachments: Vec::new(),
        }
    }

    /// Concatenated text of the message: the bare string, or every text
    /// part of a composite content in order.
    pub fn text_content(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Check the role/field combinations and every content part.
    ///
    /// Used on externally supplied messages (the `/chat` body) before
    /// they enter a run.
    pub fn validate(&self) -> Result<()> {
        if self.tool_calls.is_some() && self.role != Role::Assistant {
            return Err(Error::InvalidMessage(
                "tool_calls are only valid on assistant messages".into(),
            ));
        }
        match self.role {
            Role::Tool => {
                if self.tool_call_id.is_none() {
                    return Err(Error::InvalidMessage(
                        "tool messages must carry a tool_call_id".into(),
                    ));
                }
            }
            _ => {
                if self.tool_call_id.is_some() {
                    return Err(Error::InvalidMessage(
                        "tool_call_id is only valid on tool messages".into(),
                    ));
                }
            }
        }
        if let MessageContent::Parts(parts) = &self.content {
            for part in parts {
                validate_part(part)?;
            }
        }
        for att in &self.attachments {
            sanitize_filename(&att.filename)?;
            if let Some(url) = &att.url {
                validate_url(url)?;
            }
            if let Some(data) = &att.data {
                validate_inline_data(data)?;
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Part validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn validate_part(part: &ContentPart) -> Result<()> {
    match part {
        ContentPart::Text { .. } => Ok(()),
        ContentPart::Image { url, data, .. } => validate_ref(url.as_deref(), data.as_deref(), None),
        ContentPart::File {
            url,
            data,
            filename,
            ..
        } => validate_ref(url.as_deref(), data.as_deref(), filename.as_deref()),
    }
}

fn validate_ref(url: Option<&str>, data: Option<&str>, filename: Option<&str>) -> Result<()> {
    if url.is_none() && data.is_none() {
        return Err(Error::InvalidMessage(
            "reference part needs a url or inline data".into(),
        ));
    }
    if let Some(url) = url {
        validate_url(url)?;
    }
    if let Some(data) = data {
        validate_inline_data(data)?;
    }
    if let Some(name) = filename {
        sanitize_filename(name)?;
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    let scheme = url.split(':').next().unwrap_or("");
    if !ALLOWED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
        return Err(Error::InvalidMessage(format!(
            "url scheme '{scheme}' is not allowed (http/https/data only)"
        )));
    }
    Ok(())
}

fn validate_inline_data(data: &str) -> Result<()> {
    // Base64 expands by 4/3; bound on the encoded length avoids decoding
    // oversized payloads just to reject them.
    if data.len() > MAX_INLINE_BYTES / 3 * 4 + 4 {
        return Err(Error::InvalidMessage(format!(
            "inline data exceeds {MAX_INLINE_BYTES} bytes"
        )));
    }
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| Error::InvalidMessage(format!("inline data is not valid base64: {e}")))?;
    Ok(())
}

fn sanitize_filename(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(Error::InvalidMessage(format!(
            "filename must be 1..={MAX_FILENAME_LEN} bytes"
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidMessage(
            "filename must not contain path separators".into(),
        ));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(Error::InvalidMessage(
            "filename must not contain control characters".into(),
        ));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_plain() {
        let msg = Message::user("hello");
        assert_eq!(msg.text_content(), "hello");
    }

    #[test]
    fn text_content_joins_parts() {
        let msg = Message {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "a".into() },
                ContentPart::Image {
                    url: Some("https://example.com/x.png".into()),
                    data: None,
                    media_type: None,
                },
                ContentPart::Text { text: "b".into() },
            ]),
            tool_calls: None,
            tool_call_id: None,
            attachments: Vec::new(),
        };
        assert_eq!(msg.text_content(), "ab");
    }

    #[test]
    fn tool_message_requires_call_id() {
        let mut msg = Message::tool_result("tc-1", "ok");
        assert!(msg.validate().is_ok());
        msg.tool_call_id = None;
        assert!(msg.validate().is_err());
    }

    #[test]
    fn tool_calls_only_on_assistant() {
        let mut msg = Message::user("hi");
        msg.tool_calls = Some(vec![ToolCall {
            id: "tc-1".into(),
            name: "t".into(),
            arguments: "{}".into(),
        }]);
        assert!(msg.validate().is_err());
    }

    #[test]
    fn url_scheme_whitelist() {
        assert!(validate_url("https://example.com/a").is_ok());
        assert!(validate_url("http://example.com/a").is_ok());
        assert!(validate_url("data:image/png;base64,AAAA").is_ok());
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("javascript:alert(1)").is_err());
    }

    #[test]
    fn filename_rules() {
        assert!(sanitize_filename("report.pdf").is_ok());
        assert!(sanitize_filename("a/b.pdf").is_err());
        assert!(sanitize_filename("a\\b.pdf").is_err());
        assert!(sanitize_filename("bad\nname").is_err());
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename(&"x".repeat(300)).is_err());
    }

    #[test]
    fn inline_data_must_be_base64() {
        assert!(validate_inline_data("aGVsbG8=").is_ok());
        assert!(validate_inline_data("not~~base64!!").is_err());
    }

    #[test]
    fn oversized_inline_data_rejected() {
        // Encoded length just over the cap; rejected before decoding.
        let big = "A".repeat(MAX_INLINE_BYTES / 3 * 4 + 8);
        assert!(validate_inline_data(&big).is_err());
    }

    #[test]
    fn ref_part_needs_source() {
        let part = ContentPart::File {
            url: None,
            data: None,
            filename: Some("a.txt".into()),
            media_type: None,
        };
        assert!(validate_part(&part).is_err());
    }

    #[test]
    fn message_json_round_trip() {
        let msg = Message::assistant_with_tools(
            Some("calling".into()),
            vec![ToolCall {
                id: "tc-9".into(),
                name: "lookup".into(),
                arguments: r#"{"q":"x"}"#.into(),
            }],
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
