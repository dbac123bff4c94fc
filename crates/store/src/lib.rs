//! Pluggable key-value storage.
//!
//! Every persistent concern in the runtime (auth credentials,
//! conversation records) goes through [`KvStore`], so backends can be
//! swapped without touching the components above them. Ships an
//! in-memory backend with TTL support, a JSON-file backend, and a
//! primary+fallback wrapper.

pub mod file;

pub use file::JsonFileKv;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use tiller_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A key-value backend. Operations must be atomic per key.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Set with an expiry; expired keys read back as absent.
    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All live entries whose key starts with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    async fn health_check(&self) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |t| t > Instant::now())
    }
}

/// In-memory store with lazy TTL expiry.
#[derive(Default)]
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries eagerly (reads expire lazily anyway).
    pub fn sweep(&self) {
        self.entries.write().retain(|_, e| e.live());
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.entries.write().insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let entries = self.entries.read();
        let mut hits: Vec<(String, Value)> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.live())
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hits)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Primary + fallback composition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wraps two stores: reads fall through to the fallback when the
/// primary errors or misses; writes land on the primary, with the
/// fallback taking over only when the primary fails.
pub struct FallbackKv {
    primary: Arc<dyn KvStore>,
    fallback: Arc<dyn KvStore>,
}

impl FallbackKv {
    pub fn new(primary: Arc<dyn KvStore>, fallback: Arc<dyn KvStore>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl KvStore for FallbackKv {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.primary.get(key).await {
            Ok(Some(v)) => Ok(Some(v)),
            Ok(None) => self.fallback.get(key).await,
            Err(e) => {
                tracing::warn!(key, error = %e, "primary store read failed, using fallback");
                self.fallback.get(key).await
            }
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        match self.primary.set(key, value.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(key, error = %e, "primary store write failed, using fallback");
                self.fallback.set(key, value).await
            }
        }
    }

    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        match self.primary.set_with_ttl(key, value.clone(), ttl).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(key, error = %e, "primary store write failed, using fallback");
                self.fallback.set_with_ttl(key, value, ttl).await
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let p = self.primary.delete(key).await.unwrap_or(false);
        let f = self.fallback.delete(key).await.unwrap_or(false);
        Ok(p || f)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        // Primary wins on duplicate keys.
        let mut merged: HashMap<String, Value> = self
            .fallback
            .scan(prefix)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
        for (k, v) in self.primary.scan(prefix).await? {
            merged.insert(k, v);
        }
        let mut hits: Vec<(String, Value)> = merged.into_iter().collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hits)
    }

    async fn health_check(&self) -> Result<()> {
        self.primary
            .health_check()
            .await
            .or(self.fallback.health_check().await)
    }
}

/// A store whose every operation fails; test double for failure paths.
pub struct FailingKv;

#[async_trait]
impl KvStore for FailingKv {
    async fn get(&self, _key: &str) -> Result<Option<Value>> {
        Err(Error::Store("backend unavailable".into()))
    }
    async fn set(&self, _key: &str, _value: Value) -> Result<()> {
        Err(Error::Store("backend unavailable".into()))
    }
    async fn set_with_ttl(&self, _key: &str, _value: Value, _ttl: Duration) -> Result<()> {
        Err(Error::Store("backend unavailable".into()))
    }
    async fn delete(&self, _key: &str) -> Result<bool> {
        Err(Error::Store("backend unavailable".into()))
    }
    async fn scan(&self, _prefix: &str) -> Result<Vec<(String, Value)>> {
        Err(Error::Store("backend unavailable".into()))
    }
    async fn health_check(&self) -> Result<()> {
        Err(Error::Store("backend unavailable".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_delete() {
        let kv = InMemoryKv::new();
        kv.set("a", json!(1)).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(json!(1)));
        assert!(kv.delete("a").await.unwrap());
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert!(!kv.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expires() {
        let kv = InMemoryKv::new();
        kv.set_with_ttl("a", json!("x"), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(json!("x")));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_by_prefix_sorted() {
        let kv = InMemoryKv::new();
        kv.set("tok:b", json!(2)).await.unwrap();
        kv.set("tok:a", json!(1)).await.unwrap();
        kv.set("cfg:a", json!(0)).await.unwrap();

        let hits = kv.scan("tok:").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "tok:a");
        assert_eq!(hits[1].0, "tok:b");
    }

    #[tokio::test]
    async fn scan_skips_expired() {
        let kv = InMemoryKv::new();
        kv.set("p:live", json!(1)).await.unwrap();
        kv.set_with_ttl("p:dead", json!(2), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let hits = kv.scan("p:").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "p:live");
    }

    #[tokio::test]
    async fn overwrite_clears_ttl() {
        let kv = InMemoryKv::new();
        kv.set_with_ttl("a", json!(1), Duration::from_millis(5))
            .await
            .unwrap();
        kv.set("a", json!(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(kv.get("a").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn fallback_reads_when_primary_fails() {
        let fallback = Arc::new(InMemoryKv::new());
        fallback.set("a", json!("fb")).await.unwrap();
        let kv = FallbackKv::new(Arc::new(FailingKv), fallback);
        assert_eq!(kv.get("a").await.unwrap(), Some(json!("fb")));
    }

    #[tokio::test]
    async fn fallback_writes_when_primary_fails() {
        let fallback = Arc::new(InMemoryKv::new());
        let kv = FallbackKv::new(Arc::new(FailingKv), fallback.clone());
        kv.set("a", json!(7)).await.unwrap();
        assert_eq!(fallback.get("a").await.unwrap(), Some(json!(7)));
    }

    #[tokio::test]
    async fn fallback_scan_prefers_primary() {
        let primary = Arc::new(InMemoryKv::new());
        let fallback = Arc::new(InMemoryKv::new());
        primary.set("k:a", json!("p")).await.unwrap();
        fallback.set("k:a", json!("f")).await.unwrap();
        fallback.set("k:b", json!("f")).await.unwrap();

        let kv = FallbackKv::new(primary, fallback);
        let hits = kv.scan("k:").await.unwrap();
        assert_eq!(hits, vec![("k:a".into(), json!("p")), ("k:b".into(), json!("f"))]);
    }
}
