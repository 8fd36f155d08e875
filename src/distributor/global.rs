//! Distribution of records shared by every gateway.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use super::{desired_entries, sync_prefix, DistributeOutcome, KvStore, SyncReport};
use crate::convertor::GlobalResourceConvertor;
use crate::core::config::ReleaseConfig;
use crate::core::error::ReleaseResult;
use crate::observability::metrics;

/// Reconciles plugin metadata under the global prefix
pub struct GlobalDistributor {
    store: Arc<dyn KvStore>,
    global_prefix: String,
    plugin_metadata: BTreeMap<String, Value>,
    operation_timeout: Duration,
}

impl GlobalDistributor {
    pub fn new(store: Arc<dyn KvStore>, config: &ReleaseConfig) -> Self {
        Self {
            store,
            global_prefix: config.store.global_prefix.clone(),
            plugin_metadata: config.global_plugin_metadata.clone(),
            operation_timeout: config.store.operation_timeout,
        }
    }

    /// `{global_prefix}/`
    pub fn prefix(&self) -> String {
        format!("{}/", self.global_prefix)
    }

    pub async fn distribute(&self, task_id: &str) -> DistributeOutcome {
        let started = Instant::now();
        let result = self.try_distribute().await;
        let outcome = finish("distribute", task_id, result);
        metrics::record_distribute_duration("global_distribute", outcome.ok, started.elapsed());
        outcome
    }

    pub async fn revoke(&self, task_id: &str) -> DistributeOutcome {
        let started = Instant::now();
        let result = sync_prefix(
            self.store.as_ref(),
            &self.prefix(),
            BTreeMap::new(),
            self.operation_timeout,
        )
        .await;
        let outcome = finish("revoke", task_id, result);
        metrics::record_distribute_duration("global_revoke", outcome.ok, started.elapsed());
        outcome
    }

    async fn try_distribute(&self) -> ReleaseResult<SyncReport> {
        let prefix = self.prefix();
        let records = GlobalResourceConvertor::new(&self.plugin_metadata).convert()?;

        let mut desired = BTreeMap::new();
        desired_entries(&prefix, &records, &mut desired)?;
        sync_prefix(self.store.as_ref(), &prefix, desired, self.operation_timeout).await
    }
}

fn finish(operation: &str, task_id: &str, result: ReleaseResult<SyncReport>) -> DistributeOutcome {
    match result {
        Ok(report) => {
            info!(
                task_id,
                written = report.written.len(),
                deleted = report.deleted.len(),
                "Global {} succeeded",
                operation
            );
            DistributeOutcome::success(format!(
                "global {} ok: {} written, {} deleted",
                operation,
                report.written.len(),
                report.deleted.len()
            ))
        }
        Err(e) => {
            error!(task_id, error = %e, "Global {} failed", operation);
            DistributeOutcome::failure(format!("global {} failed: {}", operation, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::InMemoryKvStore;
    use serde_json::json;

    fn config() -> ReleaseConfig {
        let mut config = ReleaseConfig::default();
        config
            .global_plugin_metadata
            .insert("bk-opentelemetry".to_string(), json!({"endpoint": "http://otel:4318"}));
        config
    }

    #[tokio::test]
    async fn test_distribute_and_revoke_global_metadata() {
        let store = Arc::new(InMemoryKvStore::new());
        store.put("/bk-gateway-apisix/demo/prod/route/x", b"{}").await.unwrap();

        let distributor = GlobalDistributor::new(store.clone(), &config());
        assert!(distributor.distribute("t").await.ok);
        assert_eq!(
            store.keys(&distributor.prefix()),
            vec!["/bk-gateway-apisix-global/plugin_metadata/bk-opentelemetry"]
        );

        assert!(distributor.revoke("t").await.ok);
        assert!(store.keys(&distributor.prefix()).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_metadata_is_reported() {
        let mut config = config();
        config.global_plugin_metadata.insert("bk-mock".to_string(), json!(3));
        let distributor = GlobalDistributor::new(Arc::new(InMemoryKvStore::new()), &config);

        let outcome = distributor.distribute("t").await;
        assert!(!outcome.ok);
        assert!(outcome.message.contains("bk-mock"));
    }
}
