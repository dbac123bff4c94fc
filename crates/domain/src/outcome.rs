//! Run outcomes and interruptions.
//!
//! A run terminates in exactly one of three ways: completed with final
//! text, interrupted pending an external decision, or failed with a
//! run-level error. Tool-level failures never appear here — they are
//! folded into the transcript as tool-result messages so the model can
//! self-correct.

use serde::{Deserialize, Serialize};

use crate::message::ToolCall;

/// Run-level error kinds (fatal to the run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelError,
    ModelBehavior,
    MaxTurnsExceeded,
    Cancelled,
    Store,
    Internal,
}

/// A non-fatal termination requiring an external decision before the
/// run can be re-invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interruption {
    ToolApproval {
        tool_call: ToolCall,
        session_id: String,
        signature: String,
    },
    ToolAuth {
        tool_call: ToolCall,
        session_id: String,
        auth_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        authorization_url: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scopes: Vec<String>,
        scheme_type: String,
    },
    ClarificationRequired {
        tool_call: ToolCall,
        session_id: String,
        question: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
    },
}

impl Interruption {
    pub fn tool_call(&self) -> &ToolCall {
        match self {
            Self::ToolApproval { tool_call, .. }
            | Self::ToolAuth { tool_call, .. }
            | Self::ClarificationRequired { tool_call, .. } => tool_call,
        }
    }
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        output: String,
    },
    Interrupted {
        interruptions: Vec<Interruption>,
    },
    Error {
        error: ErrorKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl RunOutcome {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            error: kind,
            message: Some(message.into()),
        }
    }

    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}
