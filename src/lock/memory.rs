//! Process-local lock backend.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::LockBackend;
use crate::core::error::ReleaseResult;

#[derive(Debug, Clone)]
struct Holder {
    token: String,
    expires_at: Instant,
}

/// Locks held in a concurrent map, expiring after their ttl
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    holders: DashMap<String, Holder>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.holders
            .get(key)
            .map(|holder| holder.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> ReleaseResult<bool> {
        let now = Instant::now();
        let holder = Holder {
            token: token.to_string(),
            expires_at: now + ttl,
        };

        match self.holders.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(false);
                }
                occupied.insert(holder);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(holder);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> ReleaseResult<bool> {
        Ok(self
            .holders
            .remove_if(key, |_, holder| holder.token == token)
            .is_some())
    }
}
