//! Conversation backend layered over a [`KvStore`].
//!
//! KV backends have no multi-operation transactions, so appends are
//! read-modify-write cycles serialized by a per-conversation mutex.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use tiller_domain::{Error, Message, Result};
use tiller_store::KvStore;

use crate::provider::{ConversationMetadata, ConversationRecord, MemoryProvider};
use crate::retention::RetentionPolicy;

const KEY_PREFIX: &str = "conv:";

pub struct KvMemory {
    store: Arc<dyn KvStore>,
    retention: RetentionPolicy,
    /// Per-conversation write serialization.
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KvMemory {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            retention: RetentionPolicy::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    fn key(id: &str) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    fn lock_for(&self, id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn read(&self, id: &str) -> Result<Option<ConversationRecord>> {
        match self.store.get(&Self::key(id)).await? {
            Some(value) => {
                let record = serde_json::from_value(value)
                    .map_err(|e| Error::Store(format!("corrupt conversation {id}: {e}")))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn write(&self, record: &ConversationRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.store.set(&Self::key(&record.id), value).await
    }
}

#[async_trait]
impl MemoryProvider for KvMemory {
    async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        self.read(id).await
    }

    async fn append_messages(
        &self,
        id: &str,
        messages: &[Message],
        metadata_patch: Option<ConversationMetadata>,
    ) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.read(id).await?.unwrap_or_else(|| ConversationRecord {
            id: id.to_owned(),
            ..Default::default()
        });
        record.messages.extend_from_slice(messages);
        self.retention.apply(&mut record.messages);
        if let Some(patch) = metadata_patch {
            record.metadata.merge(patch);
        }
        self.write(&record).await
    }

    async fn store_messages(
        &self,
        id: &str,
        messages: &[Message],
        metadata: ConversationMetadata,
    ) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        if self.read(id).await?.is_some() {
            return Ok(());
        }
        let mut record = ConversationRecord {
            id: id.to_owned(),
            messages: messages.to_vec(),
            metadata,
        };
        self.retention.apply(&mut record.messages);
        self.write(&record).await
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.store.delete(&Self::key(id)).await
    }

    async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_store::InMemoryKv;

    fn mem() -> KvMemory {
        KvMemory::new(Arc::new(InMemoryKv::new()))
    }

    #[tokio::test]
    async fn round_trip() {
        let m = mem();
        m.append_messages("c1", &[Message::user("hi")], None)
            .await
            .unwrap();
        let record = m.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(record.id, "c1");
        assert_eq!(record.messages.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_all_land() {
        let m = Arc::new(mem());
        let mut handles = Vec::new();
        for i in 0..10 {
            let m = m.clone();
            handles.push(tokio::spawn(async move {
                m.append_messages("c1", &[Message::user(format!("m{i}"))], None)
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let record = m.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 10);
    }

    #[tokio::test]
    async fn store_then_delete() {
        let m = mem();
        m.store_messages("c1", &[Message::user("a")], Default::default())
            .await
            .unwrap();
        assert!(m.delete_conversation("c1").await.unwrap());
        assert!(m.get_conversation("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retention_window_applies() {
        let m = mem().with_retention(RetentionPolicy::new(Some(3)));
        for i in 0..6 {
            m.append_messages("c1", &[Message::user(format!("m{i}"))], None)
                .await
                .unwrap();
        }
        let record = m.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 3);
        assert_eq!(record.messages[0].text_content(), "m3");
    }
}
