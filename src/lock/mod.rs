//! # Release Lock
//!
//! At most one release may be in flight per (gateway, stage). Acquisition is
//! an explicit call that retries for a bounded time; release is an explicit
//! call too, and callers must make it on every exit path once a lease is held.
//!
//! Leases carry a random token so that a holder whose lease expired cannot
//! release a lock someone else acquired since.

pub mod memory;
pub mod redis_lock;

pub use memory::MemoryLockBackend;
pub use redis_lock::RedisLockBackend;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::config::LockConfig;
use crate::core::error::{ReleaseError, ReleaseResult};
use crate::observability::metrics;

/// Primitive lock operations
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take `key` for `ttl` if it is free or expired
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> ReleaseResult<bool>;

    /// Free `key` if it is still held with `token`
    async fn unlock(&self, key: &str, token: &str) -> ReleaseResult<bool>;
}

/// `{gateway_id}_{stage_id}`
pub fn lock_key(gateway_id: i64, stage_id: i64) -> String {
    format!("{}_{}", gateway_id, stage_id)
}

/// A held lock
#[derive(Debug)]
pub struct LockLease {
    pub key: String,
    token: String,
    acquired_at: Instant,
}

impl LockLease {
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

pub struct ReleaseLock {
    backend: Arc<dyn LockBackend>,
    ttl: Duration,
    timeout: Duration,
    retry_interval: Duration,
    max_retries: u32,
}

impl ReleaseLock {
    pub fn new(backend: Arc<dyn LockBackend>, config: &LockConfig) -> Self {
        Self {
            backend,
            ttl: config.ttl,
            timeout: config.timeout,
            retry_interval: config.retry_interval,
            max_retries: config.max_retries,
        }
    }

    /// Acquire `key`, retrying every `retry_interval`
    ///
    /// Gives up with `LockTimeout` after `max_retries` attempts or once the
    /// next attempt would start past `timeout`. Backend errors count as
    /// failed attempts.
    pub async fn acquire(&self, key: &str) -> ReleaseResult<LockLease> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.backend.try_lock(key, &token, self.ttl).await {
                Ok(true) => {
                    debug!(key, attempts, "Release lock acquired");
                    return Ok(LockLease {
                        key: key.to_string(),
                        token,
                        acquired_at: Instant::now(),
                    });
                }
                Ok(false) => {
                    metrics::record_lock_contention();
                    debug!(key, attempts, "Release lock held elsewhere");
                }
                Err(e) => {
                    warn!(key, attempts, error = %e, "Release lock attempt failed");
                }
            }

            if attempts >= self.max_retries || Instant::now() + self.retry_interval > deadline {
                warn!(key, attempts, "Giving up on release lock");
                return Err(ReleaseError::LockTimeout {
                    key: key.to_string(),
                    attempts,
                });
            }

            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Release a lease; `false` if it had expired and was taken over
    pub async fn release(&self, lease: LockLease) -> ReleaseResult<bool> {
        let released = self.backend.unlock(&lease.key, &lease.token).await?;
        if released {
            debug!(key = %lease.key, held_ms = lease.held_for().as_millis() as u64, "Release lock released");
        } else {
            warn!(key = %lease.key, "Release lock expired before release");
        }
        Ok(released)
    }
}
