//! Per-conversation concurrency control.
//!
//! Exactly one turn advances a conversation at a time. A second
//! request arriving while a turn is in flight is rejected with a
//! "busy" error rather than queued.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Manages per-conversation run locks.
///
/// Each conversation id maps to a `Semaphore(1)`. Holding the permit
/// grants exclusive access for one turn; it auto-releases on drop.
pub struct RunLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for RunLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the run lock for a conversation, or fail fast when a
    /// turn is already in progress.
    pub fn acquire(&self, conversation_id: &str) -> Result<OwnedSemaphorePermit, ConversationBusy> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(conversation_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.try_acquire_owned().map_err(|_| ConversationBusy)
    }

    /// Number of tracked conversations (for the health endpoint).
    pub fn conversation_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop locks that are not currently held.
    pub fn prune_idle(&self) {
        self.locks.lock().retain(|_, sem| sem.available_permits() == 0);
    }
}

/// A turn is already in progress for this conversation.
#[derive(Debug)]
pub struct ConversationBusy;

impl std::fmt::Display for ConversationBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a run is already in progress for this conversation")
    }
}

impl std::error::Error for ConversationBusy {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_access() {
        let map = RunLockMap::new();
        let permit = map.acquire("c1").unwrap();
        drop(permit);
        let permit = map.acquire("c1").unwrap();
        drop(permit);
    }

    #[test]
    fn busy_while_held() {
        let map = RunLockMap::new();
        let _permit = map.acquire("c1").unwrap();
        assert!(map.acquire("c1").is_err());
    }

    #[test]
    fn different_conversations_are_independent() {
        let map = RunLockMap::new();
        let _p1 = map.acquire("c1").unwrap();
        let _p2 = map.acquire("c2").unwrap();
        assert_eq!(map.conversation_count(), 2);
    }

    #[test]
    fn prune_drops_released_locks() {
        let map = RunLockMap::new();
        {
            let _p = map.acquire("c1").unwrap();
            let _q = map.acquire("c2").unwrap();
            map.prune_idle();
            assert_eq!(map.conversation_count(), 2);
        }
        map.prune_idle();
        assert_eq!(map.conversation_count(), 0);
    }
}
