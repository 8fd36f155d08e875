//! Drift reconciliation across every active gateway and stage.
//!
//! A batch run walks the repository, reports which stages are behind the
//! latest resource version, and optionally snapshots drifted gateways and
//! publishes the stages that are behind. Stages already on the latest
//! version are re-synced to heal store drift without writing a history.
//! Failures are collected per gateway or stage and never abort the run.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ReleaseRequest, Releaser};
use crate::convertor::ReleaseData;
use crate::core::error::{ReleaseError, ReleaseResult};
use crate::distributor::Distributor;
use crate::domain::{Gateway, PublishId, PublishSource, Stage};
use crate::lock::{lock_key, ReleaseLock};
use crate::repository::ReleaseRepository;
use crate::snapshot::SnapshotStore;

const OPERATOR: &str = "batch-reconciler";

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Snapshot gateways whose live resources drifted from their latest version
    pub create_versions: bool,
    /// Publish stages behind the latest version and re-sync the others
    pub publish: bool,
}

/// A stage and the versions it is released at and could be released at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageDrift {
    pub gateway: String,
    pub stage: String,
    pub released_version_id: Option<i64>,
    pub latest_version_id: Option<i64>,
}

impl StageDrift {
    pub fn is_behind(&self) -> bool {
        self.latest_version_id.is_some() && self.released_version_id != self.latest_version_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub gateway: String,
    pub stage: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub gateways_scanned: usize,
    pub stages_scanned: usize,
    /// Gateways whose live resources differ from their latest version
    pub drifted_gateways: Vec<String>,
    /// Stages behind the latest version, as found before publishing
    pub behind: Vec<StageDrift>,
    pub versions_created: usize,
    pub published: usize,
    pub resynced: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, gateway: &Gateway, stage: Option<&Stage>, error: &ReleaseError) {
        warn!(
            gateway = %gateway.name,
            stage = stage.map(|s| s.name.as_str()),
            error = %error,
            "Batch reconciliation step failed"
        );
        self.failures.push(BatchFailure {
            gateway: gateway.name.clone(),
            stage: stage.map(|s| s.name.clone()),
            message: error.to_string(),
        });
    }
}

pub struct BatchReconciler {
    repository: Arc<dyn ReleaseRepository>,
    snapshots: Arc<SnapshotStore>,
    releaser: Arc<Releaser>,
    distributor: Arc<Distributor>,
    lock: Arc<ReleaseLock>,
}

impl BatchReconciler {
    pub fn new(
        repository: Arc<dyn ReleaseRepository>,
        snapshots: Arc<SnapshotStore>,
        releaser: Arc<Releaser>,
        distributor: Arc<Distributor>,
        lock: Arc<ReleaseLock>,
    ) -> Self {
        Self {
            repository,
            snapshots,
            releaser,
            distributor,
            lock,
        }
    }

    pub async fn run(&self, options: BatchOptions) -> ReleaseResult<BatchReport> {
        let mut report = BatchReport::default();

        for gateway in self.repository.list_gateways().await? {
            if !gateway.status.is_active() {
                continue;
            }
            report.gateways_scanned += 1;
            self.reconcile_gateway(&gateway, options, &mut report).await;
        }

        info!(
            gateways = report.gateways_scanned,
            stages = report.stages_scanned,
            drifted = report.drifted_gateways.len(),
            behind = report.behind.len(),
            versions_created = report.versions_created,
            published = report.published,
            resynced = report.resynced,
            failures = report.failures.len(),
            "Batch reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_gateway(&self, gateway: &Gateway, options: BatchOptions, report: &mut BatchReport) {
        match self.snapshots.drift(gateway.id).await {
            Ok(drift) if !drift.is_empty() => {
                report.drifted_gateways.push(gateway.name.clone());
                if options.create_versions {
                    match self
                        .snapshots
                        .create_version(gateway.id, "batch", "created by batch reconciliation", OPERATOR)
                        .await
                    {
                        Ok(_) => report.versions_created += 1,
                        Err(e) => report.fail(gateway, None, &e),
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                report.fail(gateway, None, &e);
                return;
            }
        }

        let latest = match self.snapshots.latest_version(gateway.id).await {
            Ok(latest) => latest.map(|v| v.id),
            Err(e) => {
                report.fail(gateway, None, &e);
                return;
            }
        };

        let stages = match self.repository.list_stages(gateway.id).await {
            Ok(stages) => stages,
            Err(e) => {
                report.fail(gateway, None, &e);
                return;
            }
        };

        for stage in stages.iter().filter(|s| s.status.is_active()) {
            report.stages_scanned += 1;

            let released = match self.repository.get_release(gateway.id, stage.id).await {
                Ok(release) => release.map(|r| r.resource_version_id),
                Err(e) => {
                    report.fail(gateway, Some(stage), &e);
                    continue;
                }
            };
            let drift = StageDrift {
                gateway: gateway.name.clone(),
                stage: stage.name.clone(),
                released_version_id: released,
                latest_version_id: latest,
            };
            let behind = drift.is_behind();
            if behind {
                report.behind.push(drift);
            }

            if !options.publish {
                continue;
            }
            if behind {
                self.publish(gateway, stage, latest, report).await;
            } else if released.is_some() {
                match self.releaser.is_revoked(gateway.id, stage.id).await {
                    Ok(true) => {
                        debug!(gateway = %gateway.name, stage = %stage.name, "Stage revoked, not re-syncing");
                    }
                    Ok(false) => self.resync(gateway, stage, report).await,
                    Err(e) => report.fail(gateway, Some(stage), &e),
                }
            }
        }
    }

    async fn publish(&self, gateway: &Gateway, stage: &Stage, version_id: Option<i64>, report: &mut BatchReport) {
        let request = ReleaseRequest {
            gateway_id: gateway.id,
            stage_ids: vec![stage.id],
            resource_version_id: version_id,
            comment: "published by batch reconciliation".to_string(),
            operator: OPERATOR.to_string(),
            source: PublishSource::CliSync,
        };

        match self.releaser.release(&request).await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    match outcome.error {
                        None => report.published += 1,
                        Some(e) => report.fail(gateway, Some(stage), &e),
                    }
                }
            }
            Err(e) => report.fail(gateway, Some(stage), &e),
        }
    }

    /// Rewrite the released records of a stage without recording a history
    async fn resync(&self, gateway: &Gateway, stage: &Stage, report: &mut BatchReport) {
        let lease = match self.lock.acquire(&lock_key(gateway.id, stage.id)).await {
            Ok(lease) => lease,
            Err(e) => {
                report.fail(gateway, Some(stage), &e);
                return;
            }
        };

        let result = async {
            let data = ReleaseData::load(self.repository.as_ref(), gateway.id, stage.id, None).await?;
            let task_id = Uuid::new_v4().to_string();
            let outcome = self
                .distributor
                .distribute(&data, PublishId::NO_REPORT, &task_id)
                .await;
            if outcome.ok {
                Ok(())
            } else {
                Err(ReleaseError::store(outcome.message))
            }
        }
        .await;

        if let Err(e) = self.lock.release(lease).await {
            warn!(gateway = %gateway.name, stage = %stage.name, error = %e, "Failed to release lock");
        }

        match result {
            Ok(()) => report.resynced += 1,
            Err(e) => report.fail(gateway, Some(stage), &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convertor::PluginRegistry;
    use crate::core::config::{LockConfig, ReleaseConfig};
    use crate::distributor::{InMemoryKvStore, KvStore};
    use crate::domain::{
        Backend, BackendConfig, BackendHost, LoadBalance, Resource, ResourceAuthConfig,
        ResourceProxyConfig, Status,
    };
    use crate::lock::MemoryLockBackend;
    use crate::release::RevokeRequest;
    use crate::repository::InMemoryRepository;
    use std::collections::BTreeMap;

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        store: Arc<InMemoryKvStore>,
        releaser: Arc<Releaser>,
        reconciler: BatchReconciler,
    }

    fn resource(id: i64, gateway_id: i64, backend_id: i64) -> Resource {
        Resource {
            id,
            gateway_id,
            name: format!("r{}", id),
            description: String::new(),
            method: "GET".to_string(),
            path: format!("/r{}", id),
            match_subpath: false,
            enable_websocket: false,
            is_public: true,
            auth: ResourceAuthConfig::default(),
            proxy: ResourceProxyConfig {
                backend_id,
                method: "GET".to_string(),
                path: format!("/r{}", id),
                timeout_secs: None,
            },
            plugins: vec![],
            disabled_stages: vec![],
        }
    }

    fn add_gateway(repo: &InMemoryRepository, id: i64, name: &str, status: Status) {
        let stage_id = id * 10;
        let backend_id = id * 100;
        repo.upsert_gateway(Gateway {
            id,
            name: name.to_string(),
            status,
            is_programmable: false,
            tenant_id: None,
        });
        repo.upsert_stage(Stage {
            id: stage_id,
            gateway_id: id,
            name: "prod".to_string(),
            status: Status::Active,
            vars: BTreeMap::new(),
        });
        repo.upsert_backend(Backend {
            id: backend_id,
            gateway_id: id,
            name: "default".to_string(),
        });
        repo.upsert_backend_config(BackendConfig {
            backend_id,
            stage_id,
            load_balance: LoadBalance::RoundRobin,
            hash_on: None,
            key: None,
            hosts: vec![BackendHost {
                scheme: "http".to_string(),
                host: "10.0.0.1:8080".to_string(),
                weight: 100,
            }],
            timeout_secs: 30,
        });
        repo.upsert_resource(resource(id * 1000, id, backend_id));
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        add_gateway(&repo, 1, "alpha", Status::Active);
        add_gateway(&repo, 2, "beta", Status::Active);
        add_gateway(&repo, 3, "gamma", Status::Inactive);

        let config = ReleaseConfig::default();
        let store = Arc::new(InMemoryKvStore::new());
        let lock = Arc::new(ReleaseLock::new(
            Arc::new(MemoryLockBackend::new()),
            &LockConfig::default(),
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
        let reconciler =
            BatchReconciler::new(repo.clone(), snapshots, releaser.clone(), distributor, lock);

        Fixture {
            repo,
            store,
            releaser,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_report_only_changes_nothing() {
        let f = fixture();
        let report = f.reconciler.run(BatchOptions::default()).await.unwrap();

        assert_eq!(report.gateways_scanned, 2);
        assert_eq!(report.stages_scanned, 2);
        assert_eq!(report.drifted_gateways, vec!["alpha", "beta"]);
        // no version exists yet, so no stage can be behind one
        assert!(report.behind.is_empty());
        assert_eq!(report.versions_created, 0);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_create_and_publish_active_stages() {
        let f = fixture();
        let report = f
            .reconciler
            .run(BatchOptions {
                create_versions: true,
                publish: true,
            })
            .await
            .unwrap();

        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(report.versions_created, 2);
        assert_eq!(report.behind.len(), 2);
        assert_eq!(report.published, 2);
        assert!(f.repo.get_release(1, 10).await.unwrap().is_some());
        assert!(f.repo.get_release(3, 30).await.unwrap().is_none());

        let histories = f.repo.list_release_histories(1).await.unwrap();
        assert_eq!(histories[0].source, PublishSource::CliSync);
    }

    #[tokio::test]
    async fn test_second_run_resyncs_without_history() {
        let f = fixture();
        let options = BatchOptions {
            create_versions: true,
            publish: true,
        };
        f.reconciler.run(options).await.unwrap();

        let route_key = "/bk-gateway-apisix/alpha/prod/route/alpha.prod.1000";
        assert!(f.store.delete(route_key).await.unwrap());

        let report = f.reconciler.run(options).await.unwrap();
        assert!(report.behind.is_empty());
        assert_eq!(report.published, 0);
        assert_eq!(report.resynced, 2);
        assert!(f.store.get(route_key).await.unwrap().is_some());
        assert_eq!(f.repo.list_release_histories(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_collected() {
        let f = fixture();
        let mut broken = resource(2001, 2, 0);
        broken.name = "broken".to_string();
        f.repo.upsert_resource(broken);

        let report = f
            .reconciler
            .run(BatchOptions {
                create_versions: true,
                publish: true,
            })
            .await
            .unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].gateway, "beta");
        assert_eq!(report.failures[0].stage.as_deref(), Some("prod"));
        assert!(report.failures[0].message.contains("broken"));
    }

    #[tokio::test]
    async fn test_revoked_stage_stays_down() {
        let f = fixture();
        let options = BatchOptions {
            create_versions: true,
            publish: true,
        };
        f.reconciler.run(options).await.unwrap();

        let revoked = f
            .releaser
            .revoke(&RevokeRequest {
                gateway_id: 1,
                stage_ids: vec![10],
                comment: String::new(),
                operator: "admin".to_string(),
                source: PublishSource::StageDisable,
                delete_all: false,
            })
            .await
            .unwrap();
        assert!(revoked[0].is_success(), "{}", revoked[0].message);
        assert!(f.releaser.is_revoked(1, 10).await.unwrap());
        assert!(!f.releaser.is_revoked(2, 20).await.unwrap());

        let report = f.reconciler.run(options).await.unwrap();
        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(report.resynced, 1);
        assert!(f
            .store
            .list_prefix("/bk-gateway-apisix/alpha/prod/")
            .await
            .unwrap()
            .is_empty());

        // publishing again clears the revoke
        f.releaser
            .release(&ReleaseRequest {
                gateway_id: 1,
                stage_ids: vec![10],
                resource_version_id: None,
                comment: String::new(),
                operator: "admin".to_string(),
                source: PublishSource::VersionPublish,
            })
            .await
            .unwrap();
        assert!(!f.releaser.is_revoked(1, 10).await.unwrap());
    }
}
