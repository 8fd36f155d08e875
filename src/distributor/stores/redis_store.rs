//! # Redis Store
//!
//! Keys are stored verbatim; prefix listing uses `SCAN MATCH prefix*` with
//! glob metacharacters in the prefix escaped. Watch events only cover
//! changes made through this instance.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use super::{KvStore, WatchEvent, WATCH_CHANNEL_CAPACITY};
use crate::core::config::StoreConfig;
use crate::core::error::{ReleaseError, ReleaseResult};
use crate::observability::logging::redact_url;

const SCAN_COUNT: usize = 1000;
const MGET_BATCH: usize = 500;

/// Redis store configuration
#[derive(Debug, Clone)]
pub struct RedisKvStoreConfig {
    pub url: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RedisKvStoreConfig {
    pub fn from_store_config(config: &StoreConfig) -> ReleaseResult<Self> {
        let url = config
            .redis_url
            .clone()
            .ok_or_else(|| ReleaseError::config("store.redis_url is required for the redis backend"))?;
        Ok(Self {
            url,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        })
    }
}

type RedisFuture<'a, T> = Pin<Box<dyn Future<Output = RedisResult<T>> + Send + 'a>>;

pub struct RedisKvStore {
    config: RedisKvStoreConfig,
    connection_manager: RwLock<ConnectionManager>,
    events: broadcast::Sender<WatchEvent>,
}

impl RedisKvStore {
    pub async fn new(config: RedisKvStoreConfig) -> ReleaseResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection_manager = ConnectionManager::new(client).await?;
        info!(url = %redact_url(&config.url), "Redis store connected");

        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            connection_manager: RwLock::new(connection_manager),
            events,
        })
    }

    /// Run an operation, reconnecting and retrying with linear backoff on failure
    async fn execute_with_retry<F, T>(&self, operation: F) -> ReleaseResult<T>
    where
        F: for<'c> Fn(&'c mut ConnectionManager) -> RedisFuture<'c, T> + Send + Sync,
        T: Send,
    {
        let mut retries = 0;

        loop {
            let mut conn = self.connection_manager.write().await;

            match operation(&mut *conn).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    error!(error = %e, retries, "Redis operation failed");

                    if retries >= self.config.max_retries {
                        return Err(e.into());
                    }

                    retries += 1;
                    drop(conn);

                    tokio::time::sleep(self.config.retry_delay * retries).await;

                    if let Err(reconnect_err) = self.reconnect().await {
                        warn!(error = %reconnect_err, "Failed to reconnect to Redis");
                    }
                }
            }
        }
    }

    async fn reconnect(&self) -> ReleaseResult<()> {
        let client = Client::open(self.config.url.as_str())?;
        let new_connection_manager = ConnectionManager::new(client).await?;

        let mut conn = self.connection_manager.write().await;
        *conn = new_connection_manager;

        info!("Reconnected to Redis");
        Ok(())
    }

    async fn scan_keys(&self, prefix: &str) -> ReleaseResult<Vec<String>> {
        let pattern = format!("{}*", escape_glob(prefix));

        let mut keys = self
            .execute_with_retry(|conn| {
                let pattern = pattern.clone();
                Box::pin(async move {
                    let mut cursor: u64 = 0;
                    let mut all_keys = Vec::new();

                    loop {
                        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(&pattern)
                            .arg("COUNT")
                            .arg(SCAN_COUNT)
                            .query_async(conn)
                            .await?;

                        all_keys.extend(keys);

                        if next == 0 {
                            break;
                        }
                        cursor = next;
                    }

                    Ok(all_keys)
                })
            })
            .await?;

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn notify(&self, event: WatchEvent) {
        let _ = self.events.send(event);
    }
}

/// Escape `*?[]\` so the prefix matches literally in a SCAN pattern
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn list_prefix(&self, prefix: &str) -> ReleaseResult<BTreeMap<String, Vec<u8>>> {
        let keys = self.scan_keys(prefix).await?;
        let mut listed = BTreeMap::new();

        for batch in keys.chunks(MGET_BATCH) {
            let batch = batch.to_vec();
            let values: Vec<Option<Vec<u8>>> = self
                .execute_with_retry(|conn| {
                    let batch = batch.clone();
                    Box::pin(async move { redis::cmd("MGET").arg(&batch).query_async(conn).await })
                })
                .await?;

            // Keys deleted between SCAN and MGET come back as nil
            for (key, value) in batch.into_iter().zip(values) {
                if let Some(value) = value {
                    listed.insert(key, value);
                }
            }
        }

        debug!(prefix, keys = listed.len(), "Listed prefix");
        Ok(listed)
    }

    async fn get(&self, key: &str) -> ReleaseResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.execute_with_retry(|conn| {
            let key = key.clone();
            Box::pin(async move { conn.get::<_, Option<Vec<u8>>>(&key).await })
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> ReleaseResult<()> {
        let owned_key = key.to_string();
        let value = value.to_vec();
        self.execute_with_retry(|conn| {
            let key = owned_key.clone();
            let value = value.clone();
            Box::pin(async move { conn.set::<_, _, ()>(&key, &value).await })
        })
        .await?;

        debug!(key, "Put key");
        self.notify(WatchEvent::Put {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> ReleaseResult<bool> {
        let owned_key = key.to_string();
        let deleted: i64 = self
            .execute_with_retry(|conn| {
                let key = owned_key.clone();
                Box::pin(async move { conn.del(&key).await })
            })
            .await?;

        let existed = deleted > 0;
        if existed {
            debug!(key, "Deleted key");
            self.notify(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    async fn delete_prefix(&self, prefix: &str) -> ReleaseResult<usize> {
        let keys = self.scan_keys(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let deleted: i64 = self
            .execute_with_retry(|conn| {
                let keys = keys.clone();
                Box::pin(async move { conn.del(&keys).await })
            })
            .await?;

        for key in keys {
            self.notify(WatchEvent::Delete { key });
        }
        info!(prefix, deleted, "Deleted prefix");
        Ok(deleted.max(0) as usize)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    async fn health_check(&self) -> ReleaseResult<bool> {
        let result = self
            .execute_with_retry(|conn| {
                Box::pin(async move { redis::cmd("PING").query_async::<_, String>(conn).await })
            })
            .await;

        match result {
            Ok(response) => Ok(response == "PONG"),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("/gw/demo/prod/"), "/gw/demo/prod/");
        assert_eq!(escape_glob("/gw/a*b?[c]\\"), "/gw/a\\*b\\?\\[c\\]\\\\");
    }

    #[test]
    fn test_config_requires_url() {
        let config = StoreConfig::default();
        assert!(RedisKvStoreConfig::from_store_config(&config).is_err());

        let config = StoreConfig {
            redis_url: Some("redis://localhost:6379".to_string()),
            ..Default::default()
        };
        let redis = RedisKvStoreConfig::from_store_config(&config).unwrap();
        assert_eq!(redis.max_retries, config.max_retries);
    }

    #[tokio::test]
    #[ignore] // Requires a Redis server on localhost
    async fn test_reconcile_against_redis() {
        let store = RedisKvStore::new(RedisKvStoreConfig {
            url: "redis://localhost:6379".to_string(),
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
        })
        .await
        .unwrap();

        store.delete_prefix("/test-release/").await.unwrap();
        store.put("/test-release/a", b"1").await.unwrap();
        store.put("/test-release/b", b"2").await.unwrap();

        let listed = store.list_prefix("/test-release/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.delete_prefix("/test-release/").await.unwrap(), 2);
    }
}
