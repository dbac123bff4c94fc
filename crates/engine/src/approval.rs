//! Approval decisions: persistence, merge rules, and rehydration.
//!
//! Decisions live in conversation metadata under `tool_approvals`,
//! keyed `"{session_id}:{tool_call_id}"`, and are never deleted within
//! a conversation. Because providers regenerate tool-call ids, a
//! decision also carries the call's signature; [`rehydrate`] resolves
//! persisted decisions onto the current tool calls by exact id first,
//! then by signature.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use tiller_domain::{
    tool_call_signature, ApprovalEntry, ApprovalStatus, Result, ToolCall,
};
use tiller_memory::{ConversationMetadata, MemoryProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ApprovalStore {
    memory: Arc<dyn MemoryProvider>,
}

impl ApprovalStore {
    pub fn new(memory: Arc<dyn MemoryProvider>) -> Self {
        Self { memory }
    }

    /// All persisted entries for a conversation, keyed
    /// `"{session_id}:{tool_call_id}"`.
    pub async fn entries(&self, conversation_id: &str) -> Result<HashMap<String, ApprovalEntry>> {
        Ok(self
            .memory
            .get_conversation(conversation_id)
            .await?
            .map(|record| record.metadata.tool_approvals)
            .unwrap_or_default())
    }

    /// Upsert a decision.
    ///
    /// `additional_context` merges shallowly into the stored context;
    /// the stored timestamp is preserved when neither the status nor
    /// the merged context changed, so idempotent re-submissions do not
    /// disturb audit ordering.
    pub async fn record(
        &self,
        conversation_id: &str,
        session_id: &str,
        tool_call_id: &str,
        entry: ApprovalEntry,
    ) -> Result<ApprovalEntry> {
        let key = format!("{session_id}:{tool_call_id}");
        let existing = self.entries(conversation_id).await?.remove(&key);
        let merged = merge_entry(existing, entry, tool_call_id);

        let mut patch = ConversationMetadata::default();
        patch.tool_approvals.insert(key, merged.clone());
        self.memory
            .append_messages(conversation_id, &[], Some(patch))
            .await?;
        Ok(merged)
    }

    /// Derived view: signature → entry, for rehydration diagnostics.
    pub async fn signature_index(
        &self,
        conversation_id: &str,
    ) -> Result<HashMap<String, ApprovalEntry>> {
        let mut index = HashMap::new();
        for entry in self.entries(conversation_id).await?.into_values() {
            if let Some(signature) = entry.signature.clone() {
                index.insert(signature, entry);
            }
        }
        Ok(index)
    }
}

fn merge_entry(
    existing: Option<ApprovalEntry>,
    patch: ApprovalEntry,
    tool_call_id: &str,
) -> ApprovalEntry {
    let Some(old) = existing else {
        let mut fresh = patch;
        fresh.tool_call_id = Some(tool_call_id.to_owned());
        return fresh;
    };

    let mut merged = old.clone();
    merged.status = patch.status;
    merged.approved = match patch.status {
        ApprovalStatus::Approved => Some(true),
        ApprovalStatus::Rejected => Some(false),
        ApprovalStatus::Pending => None,
    };
    merged.tool_call_id = Some(tool_call_id.to_owned());
    if patch.tool_name.is_some() {
        merged.tool_name = patch.tool_name;
    }
    if patch.signature.is_some() {
        merged.signature = patch.signature;
    }

    // Shallow context merge; patch keys win.
    merged.additional_context = match (old.additional_context.clone(), patch.additional_context) {
        (Some(mut base), Some(delta)) => {
            if let (Some(base_obj), Some(delta_obj)) = (base.as_object_mut(), delta.as_object()) {
                for (k, v) in delta_obj {
                    base_obj.insert(k.clone(), v.clone());
                }
                Some(base)
            } else {
                Some(delta)
            }
        }
        (None, Some(delta)) => Some(delta),
        (base, None) => base,
    };

    let effectively_changed =
        merged.status != old.status || merged.additional_context != old.additional_context;
    merged.timestamp = if effectively_changed {
        Utc::now()
    } else {
        old.timestamp
    };
    merged
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rehydration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve persisted decisions onto the current tool calls.
///
/// For each entry: exact `tool_call_id` match wins, then signature
/// match; anything else is stale and skipped. Only decided entries
/// (approved/rejected) seed the run — pending means undecided. When
/// several entries land on the same call, the newest timestamp wins.
pub fn rehydrate(
    current_calls: &[ToolCall],
    persisted: &HashMap<String, ApprovalEntry>,
) -> HashMap<String, ApprovalEntry> {
    let ids: std::collections::HashSet<&str> =
        current_calls.iter().map(|c| c.id.as_str()).collect();
    let by_signature: HashMap<String, &str> = current_calls
        .iter()
        .map(|c| (tool_call_signature(c), c.id.as_str()))
        .collect();

    // Deterministic application order: oldest first, so the newest
    // decision for a call ends up in the map.
    let mut entries: Vec<&ApprovalEntry> = persisted.values().collect();
    entries.sort_by_key(|e| (e.timestamp, e.tool_call_id.clone()));

    let mut resolved = HashMap::new();
    for entry in entries {
        if entry.status == ApprovalStatus::Pending {
            continue;
        }
        let target = entry
            .tool_call_id
            .as_deref()
            .filter(|id| ids.contains(id))
            .or_else(|| {
                entry
                    .signature
                    .as_ref()
                    .and_then(|sig| by_signature.get(sig).copied())
            });
        if let Some(id) = target {
            resolved.insert(id.to_owned(), entry.clone());
        }
    }
    resolved
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tiller_memory::InMemoryMemory;

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    fn store() -> ApprovalStore {
        ApprovalStore::new(Arc::new(InMemoryMemory::new()))
    }

    #[tokio::test]
    async fn record_creates_entry() {
        let store = store();
        let entry = ApprovalEntry::new(ApprovalStatus::Approved);
        store.record("c1", "sess", "tc-1", entry).await.unwrap();

        let entries = store.entries("c1").await.unwrap();
        let stored = entries.get("sess:tc-1").unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(stored.tool_call_id.as_deref(), Some("tc-1"));
        assert_eq!(stored.approved, Some(true));
    }

    #[tokio::test]
    async fn record_merges_context_shallowly() {
        let store = store();
        store
            .record(
                "c1",
                "s",
                "tc-1",
                ApprovalEntry::new(ApprovalStatus::Pending)
                    .with_context(json!({"a": 1, "b": 1})),
            )
            .await
            .unwrap();
        store
            .record(
                "c1",
                "s",
                "tc-1",
                ApprovalEntry::new(ApprovalStatus::Rejected).with_context(json!({"b": 2})),
            )
            .await
            .unwrap();

        let entries = store.entries("c1").await.unwrap();
        let stored = entries.get("s:tc-1").unwrap();
        assert_eq!(stored.status, ApprovalStatus::Rejected);
        let ctx = stored.additional_context.as_ref().unwrap();
        assert_eq!(ctx["a"], 1);
        assert_eq!(ctx["b"], 2);
    }

    #[tokio::test]
    async fn idempotent_record_preserves_timestamp() {
        let store = store();
        let first = store
            .record("c1", "s", "tc-1", ApprovalEntry::new(ApprovalStatus::Approved))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = store
            .record("c1", "s", "tc-1", ApprovalEntry::new(ApprovalStatus::Approved))
            .await
            .unwrap();
        assert_eq!(first.timestamp, second.timestamp);

        // A status change does move the timestamp.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let third = store
            .record("c1", "s", "tc-1", ApprovalEntry::new(ApprovalStatus::Rejected))
            .await
            .unwrap();
        assert!(third.timestamp > first.timestamp);
    }

    #[tokio::test]
    async fn record_keeps_signature_from_prior_entry() {
        let store = store();
        let mut pending = ApprovalEntry::new(ApprovalStatus::Pending);
        pending.signature = Some("sig-1".into());
        pending.tool_name = Some("approve_test".into());
        store.record("c1", "s", "tc-1", pending).await.unwrap();

        // The decision submission carries no signature.
        store
            .record("c1", "s", "tc-1", ApprovalEntry::new(ApprovalStatus::Approved))
            .await
            .unwrap();

        let entries = store.entries("c1").await.unwrap();
        let stored = entries.get("s:tc-1").unwrap();
        assert_eq!(stored.signature.as_deref(), Some("sig-1"));
        assert_eq!(stored.tool_name.as_deref(), Some("approve_test"));
    }

    #[tokio::test]
    async fn signature_index_only_covers_signed_entries() {
        let store = store();
        let mut signed = ApprovalEntry::new(ApprovalStatus::Approved);
        signed.signature = Some("sig-a".into());
        store.record("c1", "s", "tc-1", signed).await.unwrap();
        store
            .record("c1", "s", "tc-2", ApprovalEntry::new(ApprovalStatus::Approved))
            .await
            .unwrap();

        let index = store.signature_index("c1").await.unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.contains_key("sig-a"));
    }

    // ── rehydrate ──────────────────────────────────────────────────

    #[test]
    fn rehydrate_exact_id_match() {
        let calls = vec![call("tc-1", "t", "{}")];
        let mut persisted = HashMap::new();
        let mut entry = ApprovalEntry::new(ApprovalStatus::Approved);
        entry.tool_call_id = Some("tc-1".into());
        persisted.insert("s:tc-1".into(), entry);

        let resolved = rehydrate(&calls, &persisted);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["tc-1"].status, ApprovalStatus::Approved);
    }

    #[test]
    fn rehydrate_signature_match_survives_id_churn() {
        let original = call("tc-old", "approve_test", r#"{"x":42}"#);
        let regenerated = call("tc-new", "approve_test", r#"{"x":42}"#);

        let mut entry = ApprovalEntry::new(ApprovalStatus::Approved);
        entry.tool_call_id = Some("tc-old".into());
        entry.signature = Some(tool_call_signature(&original));
        let mut persisted = HashMap::new();
        persisted.insert("s:tc-old".into(), entry);

        let resolved = rehydrate(std::slice::from_ref(&regenerated), &persisted);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["tc-new"].status, ApprovalStatus::Approved);
    }

    #[test]
    fn rehydrate_skips_stale_and_pending() {
        let calls = vec![call("tc-1", "t", "{}")];
        let mut persisted = HashMap::new();

        let mut stale = ApprovalEntry::new(ApprovalStatus::Approved);
        stale.tool_call_id = Some("tc-gone".into());
        stale.signature = Some("sig-unrelated".into());
        persisted.insert("s:tc-gone".into(), stale);

        let mut pending = ApprovalEntry::new(ApprovalStatus::Pending);
        pending.tool_call_id = Some("tc-1".into());
        persisted.insert("s:tc-1".into(), pending);

        assert!(rehydrate(&calls, &persisted).is_empty());
    }

    #[test]
    fn rehydrate_newest_decision_wins() {
        let target = call("tc-1", "t", r#"{"x":1}"#);
        let mut persisted = HashMap::new();

        let mut older = ApprovalEntry::new(ApprovalStatus::Rejected);
        older.tool_call_id = Some("tc-1".into());
        older.timestamp = Utc::now() - chrono::TimeDelta::seconds(60);
        persisted.insert("s1:tc-1".into(), older);

        let mut newer = ApprovalEntry::new(ApprovalStatus::Approved);
        newer.signature = Some(tool_call_signature(&target));
        persisted.insert("s2:tc-1".into(), newer);

        let resolved = rehydrate(std::slice::from_ref(&target), &persisted);
        assert_eq!(resolved["tc-1"].status, ApprovalStatus::Approved);
    }
}
