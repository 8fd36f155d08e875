//! # Gateway Release - Maintenance Entry Point
//!
//! Runs one reconciliation pass of the release pipeline:
//!
//! 1. Load configuration from `GATEWAY_RELEASE_CONFIG` (default
//!    `config/release.yaml`; built-in defaults when the file is missing)
//! 2. Initialize structured logging
//! 3. Load the repository seed from `GATEWAY_RELEASE_SEED`
//! 4. Connect the configured store and lock backends
//! 5. Publish the global plugin metadata
//! 6. Snapshot drifted gateways and publish every stage that is behind
//!
//! Ctrl+C aborts the pass; locks held at that point expire after their TTL.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

use gateway_release::convertor::PluginRegistry;
use gateway_release::core::config::BackendKind;
use gateway_release::distributor::{InMemoryKvStore, RedisKvStore, RedisKvStoreConfig};
use gateway_release::lock::{LockBackend, MemoryLockBackend, RedisLockBackend};
use gateway_release::observability::init_logging;
use gateway_release::release::{BatchOptions, BatchReconciler, BatchReport};
use gateway_release::{
    Distributor, GlobalDistributor, InMemoryRepository, KvStore, ReleaseConfig, ReleaseLock,
    ReleaseRepository, Releaser, SnapshotStore,
};

const DEFAULT_CONFIG_PATH: &str = "config/release.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().await?;
    init_logging(&config.logging);

    info!("Starting gateway release pass");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    tokio::select! {
        result = run(config) => {
            let report = result?;
            if !report.is_clean() {
                for failure in &report.failures {
                    error!(
                        gateway = %failure.gateway,
                        stage = failure.stage.as_deref(),
                        message = %failure.message,
                        "Stage not reconciled"
                    );
                }
                anyhow::bail!("{} stage(s) failed to reconcile", report.failures.len());
            }
            info!("Gateway release pass complete");
        }
        _ = signal::ctrl_c() => {
            warn!("Received Ctrl+C, aborting release pass");
        }
    }

    Ok(())
}

async fn load_config() -> Result<ReleaseConfig> {
    let path = std::env::var("GATEWAY_RELEASE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    if Path::new(&path).exists() {
        return ReleaseConfig::load_from_file(&path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path));
    }

    // logging is not initialized yet
    eprintln!("Configuration file {} not found, using defaults", path);
    let mut config = ReleaseConfig::default();
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

async fn run(config: ReleaseConfig) -> Result<BatchReport> {
    let repository: Arc<dyn ReleaseRepository> = match std::env::var("GATEWAY_RELEASE_SEED") {
        Ok(path) => Arc::new(
            InMemoryRepository::load_from_file(&path)
                .await
                .with_context(|| format!("Failed to load repository seed from {}", path))?,
        ),
        Err(_) => {
            warn!("GATEWAY_RELEASE_SEED not set, starting from an empty repository");
            Arc::new(InMemoryRepository::new())
        }
    };

    let store: Arc<dyn KvStore> = match config.store.backend {
        BackendKind::Memory => Arc::new(InMemoryKvStore::new()),
        BackendKind::Redis => Arc::new(
            RedisKvStore::new(RedisKvStoreConfig::from_store_config(&config.store)?)
                .await
                .context("Failed to connect the redis store")?,
        ),
    };
    if !store.health_check().await.context("Store health check failed")? {
        anyhow::bail!("Store is not healthy");
    }

    let lock_backend: Arc<dyn LockBackend> = match config.lock.backend {
        BackendKind::Memory => Arc::new(MemoryLockBackend::new()),
        BackendKind::Redis => {
            let url = config
                .lock
                .redis_url
                .as_deref()
                .or(config.store.redis_url.as_deref())
                .context("lock.redis_url is required for the redis lock backend")?;
            Arc::new(
                RedisLockBackend::new(url)
                    .await
                    .context("Failed to connect the redis lock backend")?,
            )
        }
    };
    info!(store = ?config.store.backend, lock = ?config.lock.backend, "Backends ready");

    let global = GlobalDistributor::new(store.clone(), &config);
    let outcome = global.distribute(&Uuid::new_v4().to_string()).await;
    if !outcome.ok {
        anyhow::bail!("Global resources not published: {}", outcome.message);
    }

    let lock = Arc::new(ReleaseLock::new(lock_backend, &config.lock));
    let snapshots = Arc::new(SnapshotStore::new(repository.clone()));
    let distributor = Arc::new(Distributor::new(
        store,
        Arc::new(PluginRegistry::new()),
        &config,
    ));
    let releaser = Arc::new(Releaser::new(
        repository.clone(),
        snapshots.clone(),
        distributor.clone(),
        lock.clone(),
        config.release.clone(),
    ));

    let reconciler = BatchReconciler::new(repository, snapshots, releaser, distributor, lock);
    let report = reconciler
        .run(BatchOptions {
            create_versions: true,
            publish: true,
        })
        .await?;

    info!(
        gateways = report.gateways_scanned,
        stages = report.stages_scanned,
        versions_created = report.versions_created,
        published = report.published,
        resynced = report.resynced,
        failures = report.failures.len(),
        "Release pass summary"
    );
    Ok(report)
}
