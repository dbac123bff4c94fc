//! Immutable run state.
//!
//! A [`RunState`] is a value: every transition (`with_message`,
//! `with_approval`, `next_turn`) returns a new snapshot. The engine
//! never mutates a state it has handed out, which is what makes resume
//! and replay deterministic.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approvals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// A persisted decision about a specific tool call.
///
/// Keyed by `"{session_id}:{tool_call_id}"` in conversation metadata;
/// the `signature` lets a later run apply the decision after the
/// provider regenerates ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEntry {
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Legacy boolean mirror of `status`; kept for wire compatibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ApprovalEntry {
    pub fn new(status: ApprovalStatus) -> Self {
        Self {
            status,
            tool_call_id: None,
            tool_name: None,
            signature: None,
            approved: match status {
                ApprovalStatus::Approved => Some(true),
                ApprovalStatus::Rejected => Some(false),
                ApprovalStatus::Pending => None,
            },
            additional_context: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.additional_context = Some(context);
        self
    }

    /// The rejection reason carried in `additional_context`, if any.
    /// Accepts both the wire spelling and the internal one.
    pub fn rejection_reason(&self) -> Option<&str> {
        let ctx = self.additional_context.as_ref()?;
        ctx.get("rejectionReason")
            .or_else(|| ctx.get("rejection_reason"))
            .and_then(|v| v.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable snapshot of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub trace_id: String,
    pub conversation_id: String,
    pub current_agent: String,
    pub messages: Vec<Message>,
    /// Opaque caller-supplied value, passed unchanged to tools.
    #[serde(default)]
    pub context: Value,
    pub turn_count: u32,
    #[serde(default)]
    pub approvals: HashMap<String, ApprovalEntry>,
}

impl RunState {
    /// Fresh state for a new run against `agent` in `conversation_id`.
    pub fn new(agent: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            current_agent: agent.into(),
            messages: Vec::new(),
            context: Value::Null,
            turn_count: 0,
            approvals: HashMap::new(),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Append one message; returns the new snapshot.
    pub fn with_message(&self, message: Message) -> Self {
        let mut next = self.clone();
        next.messages.push(message);
        next
    }

    /// Append several messages in order; returns the new snapshot.
    pub fn with_messages(&self, messages: impl IntoIterator<Item = Message>) -> Self {
        let mut next = self.clone();
        next.messages.extend(messages);
        next
    }

    /// Record a decision for a tool-call id; returns the new snapshot.
    pub fn with_approval(&self, tool_call_id: impl Into<String>, entry: ApprovalEntry) -> Self {
        let mut next = self.clone();
        next.approvals.insert(tool_call_id.into(), entry);
        next
    }

    /// Increment the turn counter; returns the new snapshot.
    pub fn next_turn(&self) -> Self {
        let mut next = self.clone();
        next.turn_count += 1;
        next
    }

    /// Whether a tool-result message for this call id already exists.
    ///
    /// This is the resume-idempotence check: a call whose result is
    /// already in the transcript is never executed again.
    pub fn has_tool_result(&self, tool_call_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some(tool_call_id))
    }

    /// The most recent assistant message that carries tool calls.
    pub fn last_assistant_with_tools(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty()))
    }
}
