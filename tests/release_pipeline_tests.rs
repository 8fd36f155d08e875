//! # Release Pipeline Integration Tests
//!
//! End-to-end publishes through the public API: seed a repository, release
//! stages, and inspect what landed in the key-value store and the audit log.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use gateway_release::convertor::{PluginRegistry, ReleaseData};
use gateway_release::core::config::LockConfig;
use gateway_release::distributor::{InMemoryKvStore, WatchEvent};
use gateway_release::domain::{PublishEventStatus, PublishId, PublishSource, ReleaseStatus};
use gateway_release::lock::MemoryLockBackend;
use gateway_release::release::{BatchOptions, BatchReconciler};
use gateway_release::{
    Distributor, GlobalDistributor, InMemoryRepository, KvStore, ReleaseConfig, ReleaseError,
    ReleaseLock, ReleaseRepository, ReleaseRequest, ReleaseResult, Releaser, RevokeRequest,
    SnapshotStore,
};

const SEED: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/seed.yaml");
const CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/release.yaml");

/// Delays every write so concurrent publishes would overlap without the lock
struct SlowStore {
    inner: InMemoryKvStore,
    delay: Duration,
}

#[async_trait]
impl KvStore for SlowStore {
    async fn list_prefix(&self, prefix: &str) -> ReleaseResult<BTreeMap<String, Vec<u8>>> {
        self.inner.list_prefix(prefix).await
    }

    async fn get(&self, key: &str) -> ReleaseResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> ReleaseResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> ReleaseResult<bool> {
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> ReleaseResult<usize> {
        self.inner.delete_prefix(prefix).await
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.watch()
    }

    async fn health_check(&self) -> ReleaseResult<bool> {
        self.inner.health_check().await
    }
}

struct Pipeline {
    config: ReleaseConfig,
    repo: Arc<InMemoryRepository>,
    store: Arc<dyn KvStore>,
    distributor: Arc<Distributor>,
    releaser: Arc<Releaser>,
    reconciler: BatchReconciler,
}

async fn pipeline_with_store(store: Arc<dyn KvStore>) -> Pipeline {
    let config = ReleaseConfig::default();
    let repo = Arc::new(InMemoryRepository::load_from_file(SEED).await.unwrap());

    let lock = Arc::new(ReleaseLock::new(
        Arc::new(MemoryLockBackend::new()),
        &LockConfig {
            retry_interval: Duration::from_millis(20),
            max_retries: 200,
            ..Default::default()
        },
    ));
    let snapshots = Arc::new(SnapshotStore::new(repo.clone()));
    let distributor = Arc::new(Distributor::new(
        store.clone(),
        Arc::new(PluginRegistry::new()),
        &config,
    ));
    let releaser = Arc::new(Releaser::new(
        repo.clone(),
        snapshots.clone(),
        distributor.clone(),
        lock.clone(),
        config.release.clone(),
    ));
    let reconciler = BatchReconciler::new(
        repo.clone(),
        snapshots,
        releaser.clone(),
        distributor.clone(),
        lock,
    );

    Pipeline {
        config,
        repo,
        store,
        distributor,
        releaser,
        reconciler,
    }
}

async fn pipeline() -> Pipeline {
    pipeline_with_store(Arc::new(InMemoryKvStore::new())).await
}

fn release_request(stage_ids: Vec<i64>) -> ReleaseRequest {
    ReleaseRequest {
        gateway_id: 1,
        stage_ids,
        resource_version_id: None,
        comment: "integration".to_string(),
        operator: "admin".to_string(),
        source: PublishSource::VersionPublish,
    }
}

async fn stage_entries(p: &Pipeline, stage: &str) -> BTreeMap<String, Value> {
    let prefix = p.distributor.stage_prefix("demo", stage);
    p.store
        .list_prefix(&prefix)
        .await
        .unwrap()
        .into_iter()
        .map(|(key, value)| {
            let relative = key.trim_start_matches(prefix.as_str()).to_string();
            (relative, serde_json::from_slice(&value).unwrap())
        })
        .collect()
}

#[tokio::test]
async fn test_sample_config_is_valid() {
    let config = ReleaseConfig::load_from_file(CONFIG).await.unwrap();
    assert_eq!(config.store.key_prefix, "/bk-gateway-apisix");
    assert_eq!(config.lock.ttl, Duration::from_secs(300));
}

#[tokio::test]
async fn test_publish_seeded_gateway() {
    let p = pipeline().await;
    let outcomes = p.releaser.release(&release_request(vec![1, 2])).await.unwrap();
    assert!(outcomes.iter().all(|o| o.is_success()), "{:?}", outcomes);

    let prod = stage_entries(&p, "prod").await;
    assert_eq!(
        prod.keys().cloned().collect::<Vec<_>>(),
        vec![
            "route/demo.prod.-1",
            "route/demo.prod.1",
            "route/demo.prod.2",
            "route/demo.prod.3",
            "service/demo.prod.1-1",
        ]
    );

    // create_user is disabled for the test stage
    let test = stage_entries(&p, "test").await;
    assert_eq!(
        test.keys().cloned().collect::<Vec<_>>(),
        vec![
            "route/demo.test.-1",
            "route/demo.test.1",
            "route/demo.test.2",
            "service/demo.test.2-1",
        ]
    );

    let get_user = &prod["route/demo.prod.2"];
    assert_eq!(
        get_user["uris"],
        json!([
            "/api/demo/prod/users/:id/?",
            "/api/demo/prod/users/:id/*bk_api_subpath_match_param_name"
        ])
    );
    assert_eq!(
        get_user["plugins"]["bk-proxy-rewrite"]["uri"],
        json!("/v1/users/{id}/{bk_api_subpath_match_param_name}")
    );
    assert!(get_user["priority"].as_i64().unwrap() < 0);

    let create_user = &prod["route/demo.prod.3"];
    assert_eq!(create_user["methods"], json!(["POST"]));
    assert_eq!(
        create_user["plugins"]["bk-header-rewrite"],
        json!({"set": {"X-Source": "gateway"}, "remove": ["X-Debug"]})
    );

    let service = &prod["service/demo.prod.1-1"];
    assert_eq!(service["upstream"]["nodes"].as_array().unwrap().len(), 2);
    assert_eq!(
        service["plugins"]["bk-cors"]["allow_origins"],
        json!("https://demo.example.com")
    );

    let probe = &test["route/demo.test.-1"];
    assert_eq!(probe["uris"], json!(["/api/demo/test/__apigw_version"]));
    assert_eq!(probe["methods"], json!(["GET"]));
}

#[tokio::test]
async fn test_store_matches_desired_records_then_revoke_empties() {
    let p = pipeline().await;
    let outcome = p
        .releaser
        .release(&release_request(vec![1]))
        .await
        .unwrap()
        .remove(0);
    assert!(outcome.is_success());

    let data = ReleaseData::load(p.repo.as_ref(), 1, 1, None).await.unwrap();
    let desired = p
        .distributor
        .desired_records(&data, Some(PublishId(outcome.history_id.unwrap())))
        .unwrap();
    let stored = p
        .store
        .list_prefix(&p.distributor.stage_prefix("demo", "prod"))
        .await
        .unwrap();
    assert_eq!(stored, desired);

    let revoked = p
        .releaser
        .revoke(&RevokeRequest {
            gateway_id: 1,
            stage_ids: vec![1],
            comment: String::new(),
            operator: "admin".to_string(),
            source: PublishSource::StageDisable,
            delete_all: false,
        })
        .await
        .unwrap();
    assert!(revoked[0].is_success());
    assert!(stage_entries(&p, "prod").await.is_empty());
    assert_eq!(stage_entries(&p, "test").await.len(), 0);
}

#[tokio::test]
async fn test_concurrent_releases_never_interleave() {
    let store: Arc<dyn KvStore> = Arc::new(SlowStore {
        inner: InMemoryKvStore::new(),
        delay: Duration::from_millis(10),
    });
    let p = pipeline_with_store(store).await;

    let first = {
        let releaser = p.releaser.clone();
        tokio::spawn(async move { releaser.release(&release_request(vec![1])).await })
    };
    let second = {
        let releaser = p.releaser.clone();
        tokio::spawn(async move { releaser.release(&release_request(vec![1])).await })
    };

    let first = first.await.unwrap().unwrap().remove(0);
    let second = second.await.unwrap().unwrap().remove(0);
    assert!(first.is_success(), "{}", first.message);
    assert!(second.is_success(), "{}", second.message);

    // event ids are global and increasing, so serialized publishes own disjoint id ranges
    let ranges: Vec<(i64, i64)> = {
        let mut ranges = Vec::new();
        for history_id in [first.history_id.unwrap(), second.history_id.unwrap()] {
            let events = p.repo.list_publish_events(history_id).await.unwrap();
            let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
            ranges.push((ids[0], ids[ids.len() - 1]));
        }
        ranges
    };
    let (a, b) = (ranges[0], ranges[1]);
    assert!(a.1 < b.0 || b.1 < a.0, "publishes interleaved: {:?}", ranges);
}

#[tokio::test]
async fn test_lock_held_elsewhere_times_out() {
    let p = pipeline().await;
    let backend = Arc::new(MemoryLockBackend::new());
    let impatient = ReleaseLock::new(
        backend.clone(),
        &LockConfig {
            timeout: Duration::from_millis(50),
            retry_interval: Duration::from_millis(10),
            max_retries: 3,
            ..Default::default()
        },
    );
    let lease = impatient.acquire("1_1").await.unwrap();

    let err = impatient.acquire("1_1").await.unwrap_err();
    assert!(matches!(err, ReleaseError::LockTimeout { .. }));
    assert!(err.is_retryable());

    assert!(impatient.release(lease).await.unwrap());
    assert!(p.releaser.list_histories(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_history_view_reports_every_step() {
    let p = pipeline().await;
    let outcome = p
        .releaser
        .release(&release_request(vec![1]))
        .await
        .unwrap()
        .remove(0);

    let view = p
        .releaser
        .history_view(outcome.history_id.unwrap())
        .await
        .unwrap();
    assert_eq!(view.status, ReleaseStatus::Success);
    assert_eq!(view.history.source, PublishSource::VersionPublish);
    assert_eq!(view.diff_summary.as_ref().map(Vec::len), Some(3));

    let steps: BTreeSet<u32> = view
        .events
        .iter()
        .filter(|e| e.status == PublishEventStatus::Success)
        .map(|e| e.step)
        .collect();
    assert_eq!(steps, (1..=6).collect());

    let rendered = serde_json::to_value(&view).unwrap();
    assert_eq!(rendered["status"], json!("success"));
}

#[tokio::test]
async fn test_batch_reconciler_publishes_seed() {
    let p = pipeline().await;
    let report = p
        .reconciler
        .run(BatchOptions {
            create_versions: true,
            publish: true,
        })
        .await
        .unwrap();

    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.versions_created, 1);
    assert_eq!(report.published, 2);
    assert_eq!(stage_entries(&p, "prod").await.len(), 5);

    let again = p.reconciler.run(BatchOptions::default()).await.unwrap();
    assert!(again.drifted_gateways.is_empty());
    assert!(again.behind.is_empty());
}

#[tokio::test]
async fn test_global_metadata_is_published_apart_from_stages() {
    let p = pipeline().await;
    let mut config = p.config.clone();
    config
        .global_plugin_metadata
        .insert("bk-concurrency-limit".to_string(), json!({"log_format": "default"}));

    let global = GlobalDistributor::new(p.store.clone(), &config);
    assert!(global.distribute("task").await.ok);
    let stored = p.store.list_prefix(&global.prefix()).await.unwrap();
    assert_eq!(stored.len(), 1);

    p.releaser.release(&release_request(vec![1])).await.unwrap();
    assert!(global.revoke("task").await.ok);
    assert!(p.store.list_prefix(&global.prefix()).await.unwrap().is_empty());
    assert_eq!(stage_entries(&p, "prod").await.len(), 5);
}
