//! The memory provider contract and the persisted record shape.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tiller_domain::{ApprovalEntry, Message, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Conversation metadata.
///
/// Merge semantics: scalars and `extra` keys are replaced wholesale
/// (shallow); `tool_approvals` is the one nested map that merges
/// deeply, so decisions recorded by different runs accumulate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Persisted approval decisions keyed `"{session_id}:{tool_call_id}"`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tool_approvals: HashMap<String, ApprovalEntry>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ConversationMetadata {
    /// Apply a patch: shallow merge, deep merge for `tool_approvals`.
    pub fn merge(&mut self, patch: ConversationMetadata) {
        if patch.trace_id.is_some() {
            self.trace_id = patch.trace_id;
        }
        if patch.run_id.is_some() {
            self.run_id = patch.run_id;
        }
        self.tool_approvals.extend(patch.tool_approvals);
        for (k, v) in patch.extra {
            self.extra.insert(k, v);
        }
    }
}

/// The persisted conversation: append-only messages plus metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: ConversationMetadata,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>>;

    /// Atomic append of messages plus a metadata patch. Creates the
    /// conversation if it does not exist.
    async fn append_messages(
        &self,
        id: &str,
        messages: &[Message],
        metadata_patch: Option<ConversationMetadata>,
    ) -> Result<()>;

    /// Create a conversation with the given content. Idempotent: an
    /// existing conversation is left untouched.
    async fn store_messages(
        &self,
        id: &str,
        messages: &[Message],
        metadata: ConversationMetadata,
    ) -> Result<()>;

    /// Returns `true` if the conversation existed.
    async fn delete_conversation(&self, id: &str) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_domain::ApprovalStatus;

    #[test]
    fn merge_is_shallow_except_approvals() {
        let mut meta = ConversationMetadata {
            trace_id: Some("t1".into()),
            ..Default::default()
        };
        meta.tool_approvals.insert(
            "s:tc-1".into(),
            ApprovalEntry::new(ApprovalStatus::Approved),
        );
        meta.extra
            .insert("channel".into(), serde_json::json!("web"));

        let mut patch = ConversationMetadata {
            run_id: Some("r2".into()),
            ..Default::default()
        };
        patch.tool_approvals.insert(
            "s:tc-2".into(),
            ApprovalEntry::new(ApprovalStatus::Rejected),
        );
        patch
            .extra
            .insert("channel".into(), serde_json::json!("api"));

        meta.merge(patch);
        assert_eq!(meta.trace_id.as_deref(), Some("t1"));
        assert_eq!(meta.run_id.as_deref(), Some("r2"));
        // Deep merge: both approval keys survive.
        assert_eq!(meta.tool_approvals.len(), 2);
        // Shallow merge: extra key replaced.
        assert_eq!(meta.extra["channel"], "api");
    }

    #[test]
    fn metadata_json_round_trip() {
        let mut meta = ConversationMetadata::default();
        meta.tool_approvals.insert(
            "sess:tc-1".into(),
            ApprovalEntry::new(ApprovalStatus::Approved),
        );
        meta.extra.insert("k".into(), serde_json::json!(1));
        let json = serde_json::to_string(&meta).unwrap();
        let back: ConversationMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
