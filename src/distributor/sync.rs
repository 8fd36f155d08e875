//! Prefix reconciliation.
//!
//! Makes the keys under a prefix equal a desired set: new or changed keys are
//! written, keys absent from the desired set are deleted. Every key is
//! attempted; failures are collected and reported together.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::stores::KvStore;
use crate::core::error::{ReleaseError, ReleaseResult};
use crate::observability::metrics;

/// What a successful reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.written.is_empty() && self.deleted.is_empty()
    }
}

/// Reconcile `prefix` against `desired`, bounded by `timeout`
///
/// Every desired key must start with `prefix`. Fails with `SyncFail` listing
/// the keys that could not be written or deleted; keys that were written
/// stay written.
pub async fn sync_prefix(
    store: &dyn KvStore,
    prefix: &str,
    desired: BTreeMap<String, Vec<u8>>,
    timeout: Duration,
) -> ReleaseResult<SyncReport> {
    if let Some(stray) = desired.keys().find(|key| !key.starts_with(prefix)) {
        return Err(ReleaseError::internal(format!(
            "key {} is outside prefix {}",
            stray, prefix
        )));
    }

    tokio::time::timeout(timeout, reconcile(store, prefix, desired))
        .await
        .map_err(|_| ReleaseError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })?
}

async fn reconcile(
    store: &dyn KvStore,
    prefix: &str,
    desired: BTreeMap<String, Vec<u8>>,
) -> ReleaseResult<SyncReport> {
    let existing = store.list_prefix(prefix).await?;
    let mut report = SyncReport::default();
    let mut failed = Vec::new();

    for (key, value) in &desired {
        if existing.get(key) == Some(value) {
            report.unchanged += 1;
            continue;
        }
        match store.put(key, value).await {
            Ok(()) => report.written.push(key.clone()),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to write key");
                failed.push(key.clone());
            }
        }
    }

    for key in existing.keys().filter(|key| !desired.contains_key(*key)) {
        match store.delete(key).await {
            Ok(_) => report.deleted.push(key.clone()),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete key");
                failed.push(key.clone());
            }
        }
    }

    metrics::record_sync_failures(failed.len());
    if !failed.is_empty() {
        return Err(ReleaseError::SyncFail { keys: failed });
    }

    debug!(
        prefix,
        written = report.written.len(),
        deleted = report.deleted.len(),
        unchanged = report.unchanged,
        "Prefix reconciled"
    );
    Ok(report)
}

#[cfg(test)]
pub(crate) mod testing {
    //! A store wrapper that fails selected keys

    use super::*;
    use crate::distributor::stores::{InMemoryKvStore, WatchEvent};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    pub struct FlakyStore {
        pub inner: InMemoryKvStore,
        /// Writes and deletes of keys containing this fragment fail
        pub failing: parking_lot::RwLock<Option<String>>,
        /// Listing sleeps this long first
        pub list_delay: Option<Duration>,
    }

    impl FlakyStore {
        pub fn new(failing: Option<&str>) -> Self {
            Self {
                inner: InMemoryKvStore::new(),
                failing: parking_lot::RwLock::new(failing.map(str::to_string)),
                list_delay: None,
            }
        }

        pub fn heal(&self) {
            *self.failing.write() = None;
        }

        fn check(&self, key: &str) -> ReleaseResult<()> {
            match self.failing.read().as_deref() {
                Some(fragment) if key.contains(fragment) => {
                    Err(ReleaseError::store(format!("injected failure for {}", key)))
                }
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn list_prefix(&self, prefix: &str) -> ReleaseResult<BTreeMap<String, Vec<u8>>> {
            if let Some(delay) = self.list_delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.list_prefix(prefix).await
        }

        async fn get(&self, key: &str) -> ReleaseResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> ReleaseResult<()> {
            self.check(key)?;
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> ReleaseResult<bool> {
            self.check(key)?;
            self.inner.delete(key).await
        }

        async fn delete_prefix(&self, prefix: &str) -> ReleaseResult<usize> {
            self.inner.delete_prefix(prefix).await
        }

        fn watch(&self) -> broadcast::Receiver<WatchEvent> {
            self.inner.watch()
        }

        async fn health_check(&self) -> ReleaseResult<bool> {
            Ok(true)
        }
    }
}
