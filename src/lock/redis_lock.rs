//! Redis lock backend: `SET key token NX PX ttl`, released by a
//! token-checked delete script.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use std::time::Duration;
use tracing::info;

use super::LockBackend;
use crate::core::error::ReleaseResult;
use crate::observability::logging::redact_url;

const KEY_PREFIX: &str = "gateway-release:lock:";

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLockBackend {
    connection: ConnectionManager,
    unlock_script: Script,
}

impl RedisLockBackend {
    pub async fn new(url: &str) -> ReleaseResult<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(url = %redact_url(url), "Redis lock backend connected");

        Ok(Self {
            connection,
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }

    fn full_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> ReleaseResult<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::full_key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> ReleaseResult<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .unlock_script
            .key(Self::full_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}
