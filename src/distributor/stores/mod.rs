//! # Key-Value Stores
//!
//! The distributed store the data plane watches. Records are plain bytes
//! under hierarchical string keys; reconciliation works by listing a whole
//! key prefix, so stores must support ordered prefix listing.

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryKvStore;
pub use redis_store::{RedisKvStore, RedisKvStoreConfig};

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::core::error::ReleaseResult;

/// Capacity of the change notification channel
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// A change observed on the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key } | Self::Delete { key } => key,
        }
    }
}

/// Storage operations used by the distributor
#[async_trait]
pub trait KvStore: Send + Sync {
    /// All keys starting with `prefix` with their values, ordered by key
    async fn list_prefix(&self, prefix: &str) -> ReleaseResult<BTreeMap<String, Vec<u8>>>;

    async fn get(&self, key: &str) -> ReleaseResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: &[u8]) -> ReleaseResult<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> ReleaseResult<bool>;

    /// Returns the number of deleted keys
    async fn delete_prefix(&self, prefix: &str) -> ReleaseResult<usize>;

    /// Subscribe to changes made through this store
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;

    async fn health_check(&self) -> ReleaseResult<bool>;
}
