//! Shared domain types for the Tiller agent runtime: conversation
//! messages, immutable run state, approval entries, tool-call
//! signatures, the run outcome union, and the shared error type.

pub mod config;
pub mod error;
pub mod message;
pub mod outcome;
pub mod signature;
pub mod state;

pub use error::{Error, Result};
pub use message::{Attachment, ContentPart, Message, MessageContent, Role, ToolCall};
pub use outcome::{ErrorKind, Interruption, RunOutcome};
pub use signature::tool_call_signature;
pub use state::{ApprovalEntry, ApprovalStatus, RunState};
