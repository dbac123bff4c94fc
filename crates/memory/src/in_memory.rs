//! In-memory conversation backend.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use tiller_domain::{Message, Result};

use crate::provider::{ConversationMetadata, ConversationRecord, MemoryProvider};
use crate::retention::RetentionPolicy;

/// Conversations held in a process-local map. The single write lock
/// makes every append atomic.
#[derive(Default)]
pub struct InMemoryMemory {
    conversations: RwLock<HashMap<String, ConversationRecord>>,
    retention: RetentionPolicy,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.conversations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.read().is_empty()
    }
}

#[async_trait]
impl MemoryProvider for InMemoryMemory {
    async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        Ok(self.conversations.read().get(id).cloned())
    }

    async fn append_messages(
        &self,
        id: &str,
        messages: &[Message],
        metadata_patch: Option<ConversationMetadata>,
    ) -> Result<()> {
        let mut conversations = self.conversations.write();
        let record = conversations
            .entry(id.to_owned())
            .or_insert_with(|| ConversationRecord {
                id: id.to_owned(),
                ..Default::default()
            });
        record.messages.extend_from_slice(messages);
        self.retention.apply(&mut record.messages);
        if let Some(patch) = metadata_patch {
            record.metadata.merge(patch);
        }
        Ok(())
    }

    async fn store_messages(
        &self,
        id: &str,
        messages: &[Message],
        metadata: ConversationMetadata,
    ) -> Result<()> {
        let mut conversations = self.conversations.write();
        if conversations.contains_key(id) {
            return Ok(());
        }
        let mut record = ConversationRecord {
            id: id.to_owned(),
            messages: messages.to_vec(),
            metadata,
        };
        self.retention.apply(&mut record.messages);
        conversations.insert(id.to_owned(), record);
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool> {
        Ok(self.conversations.write().remove(id).is_some())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_domain::{ApprovalEntry, ApprovalStatus};

    #[tokio::test]
    async fn append_creates_and_extends() {
        let mem = InMemoryMemory::new();
        mem.append_messages("c1", &[Message::user("a")], None)
            .await
            .unwrap();
        mem.append_messages("c1", &[Message::assistant("b")], None)
            .await
            .unwrap();

        let record = mem.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[1].text_content(), "b");
    }

    #[tokio::test]
    async fn store_is_idempotent() {
        let mem = InMemoryMemory::new();
        mem.store_messages("c1", &[Message::user("first")], Default::default())
            .await
            .unwrap();
        mem.store_messages("c1", &[Message::user("second")], Default::default())
            .await
            .unwrap();

        let record = mem.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 1);
        assert_eq!(record.messages[0].text_content(), "first");
    }

    #[tokio::test]
    async fn metadata_patch_deep_merges_approvals() {
        let mem = InMemoryMemory::new();
        let mut patch1 = ConversationMetadata::default();
        patch1
            .tool_approvals
            .insert("s:tc-1".into(), ApprovalEntry::new(ApprovalStatus::Approved));
        mem.append_messages("c1", &[], Some(patch1)).await.unwrap();

        let mut patch2 = ConversationMetadata::default();
        patch2
            .tool_approvals
            .insert("s:tc-2".into(), ApprovalEntry::new(ApprovalStatus::Rejected));
        mem.append_messages("c1", &[], Some(patch2)).await.unwrap();

        let record = mem.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(record.metadata.tool_approvals.len(), 2);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let mem = InMemoryMemory::new();
        mem.append_messages("c1", &[Message::user("a")], None)
            .await
            .unwrap();
        assert!(mem.delete_conversation("c1").await.unwrap());
        assert!(!mem.delete_conversation("c1").await.unwrap());
    }

    #[tokio::test]
    async fn retention_applies_on_append() {
        let mem = InMemoryMemory::with_retention(RetentionPolicy::new(Some(2)));
        for i in 0..5 {
            mem.append_messages("c1", &[Message::user(format!("m{i}"))], None)
                .await
                .unwrap();
        }
        let record = mem.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[1].text_content(), "m4");
    }
}
