//! JSON-file-backed store.
//!
//! Loads the whole map at open and writes through on every mutation,
//! via a temp-file rename so a crash mid-write never leaves a torn
//! file. Suited to single-process deployments that want state to
//! survive restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tiller_domain::{Error, Result};

use crate::KvStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    value: Value,
    /// Unix seconds; absent = no expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
}

impl FileEntry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > now_secs())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct JsonFileKv {
    path: PathBuf,
    entries: RwLock<HashMap<String, FileEntry>>,
}

impl JsonFileKv {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Store(format!("corrupt store file {}: {e}", path.display())))?
        } else {
            HashMap::new()
        };
        tracing::info!(
            entries = entries.len(),
            path = %path.display(),
            "file store loaded"
        );
        Ok(Self {
            path: path.to_owned(),
            entries: RwLock::new(entries),
        })
    }

    /// Serialize under the read lock, then swap the file into place.
    fn flush(&self) -> Result<()> {
        let json = {
            let entries = self.entries.read();
            serde_json::to_string_pretty(&*entries)?
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for JsonFileKv {
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
            FileEntry {
                value,
                expires_at: None,
            },
        );
        self.flush()
    }

    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.entries.write().insert(
            key.to_owned(),
            FileEntry {
                value,
                expires_at: Some(now_secs() + ttl.as_secs().max(1)),
            },
        );
        self.flush()
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.entries.write().remove(key).is_some();
        if existed {
            self.flush()?;
        }
        Ok(existed)
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
        if self.path.parent().map_or(true, |p| p.exists()) {
            Ok(())
        } else {
            Err(Error::Store(format!(
                "store directory missing: {}",
                self.path.display()
            )))
        }
    }
}
