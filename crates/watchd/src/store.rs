//! The process-wide `(watcherId, subject) -> value` global store: the only
//! mechanism for cross-watcher dependency checks and `${store.w.s}` reads.
//! Read-heavy, so a reader-writer lock is the right primitive — writers
//! hold it only for the single upsert, readers snapshot one pair per call.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct GlobalStore {
    inner: RwLock<HashMap<(String, String), Value>>,
}

impl GlobalStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn update(&self, watcher_id: &str, subject: &str, value: Value) {
        let mut map = self.inner.write().await;
        map.insert((watcher_id.to_string(), subject.to_string()), value);
    }

    pub async fn get(&self, watcher_id: &str, subject: &str) -> Option<Value> {
        let map = self.inner.read().await;
        map.get(&(watcher_id.to_string(), subject.to_string()))
            .cloned()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
