//! # In-Memory Store
//!
//! Ordered map behind a lock. Used by tests and single-process deployments.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::{KvStore, WatchEvent, WATCH_CHANNEL_CAPACITY};
use crate::core::error::ReleaseResult;

pub struct InMemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Keys starting with `prefix`, ordered
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn notify(&self, event: WatchEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn list_prefix(&self, prefix: &str) -> ReleaseResult<BTreeMap<String, Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn get(&self, key: &str) -> ReleaseResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> ReleaseResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        debug!(key, "Put key");
        self.notify(WatchEvent::Put {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> ReleaseResult<bool> {
        let existed = self.entries.write().remove(key).is_some();
        if existed {
            debug!(key, "Deleted key");
            self.notify(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    async fn delete_prefix(&self, prefix: &str) -> ReleaseResult<usize> {
        let removed: Vec<String> = {
            let mut entries = self.entries.write();
            let keys = entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };

        for key in &removed {
            self.notify(WatchEvent::Delete { key: key.clone() });
        }
        debug!(prefix, deleted = removed.len(), "Deleted prefix");
        Ok(removed.len())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    async fn health_check(&self) -> ReleaseResult<bool> {
        Ok(true)
    }
}
