//! # Distributor
//!
//! Reconciles the data-plane records of a (gateway, stage) into the
//! distributed store. Each stage owns a disjoint key prefix:
//!
//! ```text
//! {key_prefix}/{gateway}/{stage}/route/{route_id}
//! {key_prefix}/{gateway}/{stage}/service/{service_id}
//! {global_prefix}/plugin_metadata/{plugin}
//! ```
//!
//! `distribute` and `revoke` never return errors: every failure is turned
//! into a [`DistributeOutcome`] so the release orchestrator always receives a
//! structured result.

pub mod global;
pub mod stores;
pub mod sync;

pub use global::GlobalDistributor;
pub use stores::{InMemoryKvStore, KvStore, RedisKvStore, RedisKvStoreConfig, WatchEvent};
pub use sync::{sync_prefix, SyncReport};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::convertor::{
    DataPlaneRecord, PluginRegistry, ReleaseData, RouteConvertor, ServiceConvertor,
};
use crate::core::config::{ConvertorConfig, ReleaseConfig};
use crate::core::error::{ReleaseError, ReleaseResult};
use crate::domain::PublishId;
use crate::observability::metrics;

/// Result of a distribute or revoke call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributeOutcome {
    pub ok: bool,
    pub message: String,
}

impl DistributeOutcome {
    pub fn success<S: Into<String>>(message: S) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failure<S: Into<String>>(message: S) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Store key of a record under a prefix ending in `/`
pub fn record_key<R: DataPlaneRecord>(prefix: &str, record: &R) -> String {
    format!("{}{}/{}", prefix, record.kind().as_str(), record.record_id())
}

/// Encode records into the desired key set of a prefix
pub fn desired_entries<R: DataPlaneRecord>(
    prefix: &str,
    records: &[R],
    desired: &mut BTreeMap<String, Vec<u8>>,
) -> ReleaseResult<()> {
    for record in records {
        desired.insert(record_key(prefix, record), record.to_bytes()?);
    }
    Ok(())
}

/// Distributes gateway/stage records
pub struct Distributor {
    store: Arc<dyn KvStore>,
    registry: Arc<PluginRegistry>,
    convertor: ConvertorConfig,
    key_prefix: String,
    operation_timeout: Duration,
}

impl Distributor {
    pub fn new(store: Arc<dyn KvStore>, registry: Arc<PluginRegistry>, config: &ReleaseConfig) -> Self {
        Self {
            store,
            registry,
            convertor: config.convertor.clone(),
            key_prefix: config.store.key_prefix.clone(),
            operation_timeout: config.store.operation_timeout,
        }
    }

    /// `{key_prefix}/{gateway}/{stage}/`
    pub fn stage_prefix(&self, gateway: &str, stage: &str) -> String {
        format!("{}/{}/{}/", self.key_prefix, gateway, stage)
    }

    /// Key/value set the store must hold for this release
    pub fn desired_records(
        &self,
        data: &ReleaseData,
        publish_id: Option<PublishId>,
    ) -> ReleaseResult<BTreeMap<String, Vec<u8>>> {
        let prefix = self.stage_prefix(&data.gateway.name, &data.stage.name);
        let routes =
            RouteConvertor::new(data, &self.registry, &self.convertor, publish_id, false).convert()?;
        let services = ServiceConvertor::new(data, &self.registry, &self.convertor).convert()?;

        let mut desired = BTreeMap::new();
        desired_entries(&prefix, &routes, &mut desired)?;
        desired_entries(&prefix, &services, &mut desired)?;
        Ok(desired)
    }

    /// Publish the records of `data`
    pub async fn distribute(
        &self,
        data: &ReleaseData,
        publish_id: PublishId,
        task_id: &str,
    ) -> DistributeOutcome {
        let started = Instant::now();
        let result = self.try_distribute(data, publish_id).await;
        let outcome = self.finish("distribute", data, publish_id, task_id, result);
        metrics::record_distribute_duration("distribute", outcome.ok, started.elapsed());
        outcome
    }

    /// Remove the records of `data`
    ///
    /// [`PublishId::DELETE`] drops the whole prefix without conversion; any
    /// other id reconciles against an empty desired set.
    pub async fn revoke(
        &self,
        data: &ReleaseData,
        publish_id: PublishId,
        task_id: &str,
    ) -> DistributeOutcome {
        let started = Instant::now();
        let result = self.try_revoke(data, publish_id).await;
        let outcome = self.finish("revoke", data, publish_id, task_id, result);
        metrics::record_distribute_duration("revoke", outcome.ok, started.elapsed());
        outcome
    }

    async fn try_distribute(&self, data: &ReleaseData, publish_id: PublishId) -> ReleaseResult<SyncReport> {
        let prefix = self.stage_prefix(&data.gateway.name, &data.stage.name);
        let desired = self.desired_records(data, Some(publish_id))?;
        sync_prefix(self.store.as_ref(), &prefix, desired, self.operation_timeout).await
    }

    async fn try_revoke(&self, data: &ReleaseData, publish_id: PublishId) -> ReleaseResult<SyncReport> {
        let prefix = self.stage_prefix(&data.gateway.name, &data.stage.name);

        if publish_id.is_delete() {
            let drop_prefix = async {
                let existing = self.store.list_prefix(&prefix).await?;
                self.store.delete_prefix(&prefix).await?;
                Ok::<_, ReleaseError>(existing.into_keys().collect::<Vec<_>>())
            };
            let deleted = tokio::time::timeout(self.operation_timeout, drop_prefix)
                .await
                .map_err(|_| ReleaseError::Timeout {
                    timeout_ms: self.operation_timeout.as_millis() as u64,
                })??;
            return Ok(SyncReport {
                deleted,
                ..Default::default()
            });
        }

        sync_prefix(self.store.as_ref(), &prefix, BTreeMap::new(), self.operation_timeout).await
    }

    fn finish(
        &self,
        operation: &str,
        data: &ReleaseData,
        publish_id: PublishId,
        task_id: &str,
        result: ReleaseResult<SyncReport>,
    ) -> DistributeOutcome {
        match result {
            Ok(report) => {
                info!(
                    gateway = %data.gateway.name,
                    stage = %data.stage.name,
                    publish_id = %publish_id,
                    task_id,
                    written = report.written.len(),
                    deleted = report.deleted.len(),
                    "{} succeeded",
                    operation
                );
                DistributeOutcome::success(format!(
                    "{} ok: {} written, {} deleted, {} unchanged",
                    operation,
                    report.written.len(),
                    report.deleted.len(),
                    report.unchanged
                ))
            }
            Err(e) => {
                error!(
                    gateway = %data.gateway.name,
                    stage = %data.stage.name,
                    publish_id = %publish_id,
                    task_id,
                    error_type = e.error_type(),
                    error = %e,
                    "{} failed",
                    operation
                );
                DistributeOutcome::failure(format!("{} failed: {}", operation, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sync::testing::FlakyStore;
    use super::*;
    use crate::convertor::fixtures::{record, release_data};

    fn distributor(store: Arc<dyn KvStore>) -> Distributor {
        Distributor::new(store, Arc::new(PluginRegistry::new()), &ReleaseConfig::default())
    }

    #[tokio::test]
    async fn test_distribute_writes_exactly_desired_keys() {
        let store = Arc::new(InMemoryKvStore::new());
        let distributor = distributor(store.clone());
        let data = release_data(vec![record(1, "GET", "/a"), record(2, "POST", "/b")]);

        let outcome = distributor.distribute(&data, PublishId(10), "task-1").await;
        assert!(outcome.ok, "{}", outcome.message);

        let prefix = distributor.stage_prefix("demo", "prod");
        assert_eq!(prefix, "/bk-gateway-apisix/demo/prod/");
        assert_eq!(
            store.keys(&prefix),
            vec![
                format!("{}route/demo.prod.-1", prefix),
                format!("{}route/demo.prod.1", prefix),
                format!("{}route/demo.prod.2", prefix),
                format!("{}service/demo.prod.2-7", prefix),
            ]
        );
    }

    #[tokio::test]
    async fn test_redistribute_removes_dropped_resources() {
        let store = Arc::new(InMemoryKvStore::new());
        let distributor = distributor(store.clone());

        let data = release_data(vec![record(1, "GET", "/a"), record(2, "POST", "/b")]);
        assert!(distributor.distribute(&data, PublishId(1), "t").await.ok);

        let data = release_data(vec![record(1, "GET", "/a")]);
        assert!(distributor.distribute(&data, PublishId(2), "t").await.ok);

        let expected: Vec<String> = distributor
            .desired_records(&data, Some(PublishId(2)))
            .unwrap()
            .into_keys()
            .collect();
        assert_eq!(store.keys(&distributor.stage_prefix("demo", "prod")), expected);
    }

    #[tokio::test]
    async fn test_revoke_empties_prefix_both_ways() {
        let store = Arc::new(InMemoryKvStore::new());
        let distributor = distributor(store.clone());
        let data = release_data(vec![record(1, "GET", "/a")]);
        let prefix = distributor.stage_prefix("demo", "prod");

        assert!(distributor.distribute(&data, PublishId(1), "t").await.ok);
        assert!(distributor.revoke(&data, PublishId(2), "t").await.ok);
        assert!(store.keys(&prefix).is_empty());

        assert!(distributor.distribute(&data, PublishId(3), "t").await.ok);
        assert!(distributor.revoke(&data, PublishId::DELETE, "t").await.ok);
        assert!(store.keys(&prefix).is_empty());
    }

    #[tokio::test]
    async fn test_failures_become_outcomes() {
        let store = Arc::new(FlakyStore::new(Some("service/")));
        let distributor = distributor(store.clone());
        let data = release_data(vec![record(1, "GET", "/a")]);

        let outcome = distributor.distribute(&data, PublishId(1), "t").await;
        assert!(!outcome.ok);
        assert!(outcome.message.contains("service/demo.prod.2-7"));

        let mut broken = record(2, "GET", "/b");
        broken.proxy.backend_id = 0;
        let outcome = distributor
            .distribute(&release_data(vec![broken]), PublishId(2), "t")
            .await;
        assert!(!outcome.ok);
        assert!(outcome.message.contains("backend"));
    }

    #[tokio::test]
    async fn test_other_stages_are_untouched() {
        let store = Arc::new(InMemoryKvStore::new());
        let distributor = distributor(store.clone());

        let prod = release_data(vec![record(1, "GET", "/a")]);
        let mut test = release_data(vec![record(1, "GET", "/a")]);
        test.stage.name = "test".to_string();

        assert!(distributor.distribute(&prod, PublishId(1), "t").await.ok);
        assert!(distributor.distribute(&test, PublishId(1), "t").await.ok);
        assert!(distributor.revoke(&test, PublishId::DELETE, "t").await.ok);

        assert!(!store.keys(&distributor.stage_prefix("demo", "prod")).is_empty());
        assert!(store.keys(&distributor.stage_prefix("demo", "test")).is_empty());
    }
}
