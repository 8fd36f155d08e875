//! # In-Memory Repository
//!
//! A [`ReleaseRepository`] kept entirely in process memory. It backs the
//! binary's maintenance runs (seeded from a YAML document) and the tests.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::info;

use super::ReleaseRepository;
use crate::core::error::{ReleaseError, ReleaseResult};
use crate::domain::{
    Backend, BackendConfig, Gateway, NewPublishEvent, NewReleaseHistory, NewResourceVersion,
    PluginBinding, PublishEvent, Release, ReleaseHistory, Resource, ResourceVersion, Stage,
    Status, CURRENT_SCHEMA_VERSION,
};

/// Plugins bound to one stage
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StagePlugins {
    pub stage_id: i64,
    #[serde(default)]
    pub plugins: Vec<PluginBinding>,
}

/// Initial content of an [`InMemoryRepository`]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RepositorySeed {
    #[serde(default)]
    pub gateways: Vec<Gateway>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub backend_configs: Vec<BackendConfig>,
    #[serde(default)]
    pub stage_plugins: Vec<StagePlugins>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Default)]
struct RepositoryState {
    gateways: BTreeMap<i64, Gateway>,
    stages: BTreeMap<i64, Stage>,
    backends: BTreeMap<i64, Backend>,
    backend_configs: HashMap<(i64, i64), BackendConfig>,
    stage_plugins: HashMap<i64, Vec<PluginBinding>>,
    resources: BTreeMap<i64, Resource>,
    versions: BTreeMap<i64, ResourceVersion>,
    releases: HashMap<(i64, i64), Release>,
    histories: BTreeMap<i64, ReleaseHistory>,
    events: BTreeMap<i64, Vec<PublishEvent>>,
}

/// Repository held in process memory
pub struct InMemoryRepository {
    state: RwLock<RepositoryState>,
    next_version_id: AtomicI64,
    next_history_id: AtomicI64,
    next_event_id: AtomicI64,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RepositoryState::default()),
            next_version_id: AtomicI64::new(1),
            next_history_id: AtomicI64::new(1),
            next_event_id: AtomicI64::new(1),
        }
    }

    /// Build a repository from a seed document
    pub fn from_seed(seed: RepositorySeed) -> Self {
        let repository = Self::new();
        {
            let mut state = repository.state.write();
            for gateway in seed.gateways {
                state.gateways.insert(gateway.id, gateway);
            }
            for stage in seed.stages {
                state.stages.insert(stage.id, stage);
            }
            for backend in seed.backends {
                state.backends.insert(backend.id, backend);
            }
            for config in seed.backend_configs {
                state
                    .backend_configs
                    .insert((config.stage_id, config.backend_id), config);
            }
            for bound in seed.stage_plugins {
                state.stage_plugins.insert(bound.stage_id, bound.plugins);
            }
            for resource in seed.resources {
                state.resources.insert(resource.id, resource);
            }
        }
        repository
    }

    /// Load a YAML seed document
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> ReleaseResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            ReleaseError::repository(format!(
                "Failed to read seed file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let seed: RepositorySeed = serde_yaml::from_str(&content)?;

        info!(
            gateways = seed.gateways.len(),
            stages = seed.stages.len(),
            resources = seed.resources.len(),
            "Repository seed loaded"
        );

        Ok(Self::from_seed(seed))
    }

    pub fn upsert_gateway(&self, gateway: Gateway) {
        self.state.write().gateways.insert(gateway.id, gateway);
    }

    pub fn upsert_stage(&self, stage: Stage) {
        self.state.write().stages.insert(stage.id, stage);
    }

    pub fn set_gateway_status(&self, gateway_id: i64, status: Status) {
        if let Some(gateway) = self.state.write().gateways.get_mut(&gateway_id) {
            gateway.status = status;
        }
    }

    pub fn set_stage_status(&self, stage_id: i64, status: Status) {
        if let Some(stage) = self.state.write().stages.get_mut(&stage_id) {
            stage.status = status;
        }
    }

    pub fn upsert_backend(&self, backend: Backend) {
        self.state.write().backends.insert(backend.id, backend);
    }

    pub fn upsert_backend_config(&self, config: BackendConfig) {
        self.state
            .write()
            .backend_configs
            .insert((config.stage_id, config.backend_id), config);
    }

    pub fn set_stage_plugins(&self, stage_id: i64, plugins: Vec<PluginBinding>) {
        self.state.write().stage_plugins.insert(stage_id, plugins);
    }

    pub fn upsert_resource(&self, resource: Resource) {
        self.state.write().resources.insert(resource.id, resource);
    }

    pub fn remove_resource(&self, resource_id: i64) -> Option<Resource> {
        self.state.write().resources.remove(&resource_id)
    }

    /// Store a version exactly as given, e.g. one produced before a schema migration
    pub fn import_resource_version(&self, version: ResourceVersion) {
        self.next_version_id
            .fetch_max(version.id + 1, Ordering::SeqCst);
        self.state.write().versions.insert(version.id, version);
    }
}

#[async_trait]
impl ReleaseRepository for InMemoryRepository {
    async fn get_gateway(&self, gateway_id: i64) -> ReleaseResult<Gateway> {
        self.state
            .read()
            .gateways
            .get(&gateway_id)
            .cloned()
            .ok_or_else(|| ReleaseError::not_found("Gateway", gateway_id))
    }

    async fn list_gateways(&self) -> ReleaseResult<Vec<Gateway>> {
        Ok(self.state.read().gateways.values().cloned().collect())
    }

    async fn get_stage(&self, stage_id: i64) -> ReleaseResult<Stage> {
        self.state
            .read()
            .stages
            .get(&stage_id)
            .cloned()
            .ok_or_else(|| ReleaseError::not_found("Stage", stage_id))
    }

    async fn list_stages(&self, gateway_id: i64) -> ReleaseResult<Vec<Stage>> {
        Ok(self
            .state
            .read()
            .stages
            .values()
            .filter(|s| s.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn list_resources(&self, gateway_id: i64) -> ReleaseResult<Vec<Resource>> {
        Ok(self
            .state
            .read()
            .resources
            .values()
            .filter(|r| r.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn list_backends(&self, gateway_id: i64) -> ReleaseResult<Vec<Backend>> {
        Ok(self
            .state
            .read()
            .backends
            .values()
            .filter(|b| b.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn get_backend_config(
        &self,
        stage_id: i64,
        backend_id: i64,
    ) -> ReleaseResult<Option<BackendConfig>> {
        Ok(self
            .state
            .read()
            .backend_configs
            .get(&(stage_id, backend_id))
            .cloned())
    }

    async fn list_stage_plugins(&self, stage_id: i64) -> ReleaseResult<Vec<PluginBinding>> {
        Ok(self
            .state
            .read()
            .stage_plugins
            .get(&stage_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_resource_version(
        &self,
        version: NewResourceVersion,
    ) -> ReleaseResult<ResourceVersion> {
        let id = self.next_version_id.fetch_add(1, Ordering::SeqCst);
        let created = ResourceVersion {
            id,
            gateway_id: version.gateway_id,
            version: version.version,
            title: version.title,
            comment: version.comment,
            schema_version: CURRENT_SCHEMA_VERSION,
            data: version.data,
            created_by: version.created_by,
            created_time: Utc::now(),
        };
        self.state.write().versions.insert(id, created.clone());
        Ok(created)
    }

    async fn get_resource_version(&self, version_id: i64) -> ReleaseResult<ResourceVersion> {
        self.state
            .read()
            .versions
            .get(&version_id)
            .cloned()
            .ok_or_else(|| ReleaseError::not_found("ResourceVersion", version_id))
    }

    async fn latest_resource_version(
        &self,
        gateway_id: i64,
    ) -> ReleaseResult<Option<ResourceVersion>> {
        Ok(self
            .state
            .read()
            .versions
            .values()
            .rev()
            .find(|v| v.gateway_id == gateway_id)
            .cloned())
    }

    async fn count_resource_versions(&self, gateway_id: i64) -> ReleaseResult<usize> {
        Ok(self
            .state
            .read()
            .versions
            .values()
            .filter(|v| v.gateway_id == gateway_id)
            .count())
    }

    async fn get_release(&self, gateway_id: i64, stage_id: i64) -> ReleaseResult<Option<Release>> {
        Ok(self
            .state
            .read()
            .releases
            .get(&(gateway_id, stage_id))
            .cloned())
    }

    async fn upsert_release(
        &self,
        gateway_id: i64,
        stage_id: i64,
        resource_version_id: i64,
        operator: &str,
    ) -> ReleaseResult<Release> {
        let release = Release {
            gateway_id,
            stage_id,
            resource_version_id,
            updated_by: operator.to_string(),
            updated_time: Utc::now(),
        };
        self.state
            .write()
            .releases
            .insert((gateway_id, stage_id), release.clone());
        Ok(release)
    }

    async fn create_release_history(
        &self,
        history: NewReleaseHistory,
    ) -> ReleaseResult<ReleaseHistory> {
        let id = self.next_history_id.fetch_add(1, Ordering::SeqCst);
        let created = ReleaseHistory {
            id,
            gateway_id: history.gateway_id,
            stage_id: history.stage_id,
            resource_version_id: history.resource_version_id,
            source: history.source,
            comment: history.comment,
            created_by: history.created_by,
            created_time: Utc::now(),
        };
        let mut state = self.state.write();
        state.histories.insert(id, created.clone());
        state.events.insert(id, Vec::new());
        Ok(created)
    }

    async fn get_release_history(&self, history_id: i64) -> ReleaseResult<ReleaseHistory> {
        self.state
            .read()
            .histories
            .get(&history_id)
            .cloned()
            .ok_or_else(|| ReleaseError::not_found("ReleaseHistory", history_id))
    }

    async fn list_release_histories(&self, gateway_id: i64) -> ReleaseResult<Vec<ReleaseHistory>> {
        Ok(self
            .state
            .read()
            .histories
            .values()
            .rev()
            .filter(|h| h.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn add_publish_event(&self, event: NewPublishEvent) -> ReleaseResult<PublishEvent> {
        let mut state = self.state.write();
        let events = state
            .events
            .get_mut(&event.history_id)
            .ok_or_else(|| ReleaseError::not_found("ReleaseHistory", event.history_id))?;

        let created = PublishEvent {
            id: self.next_event_id.fetch_add(1, Ordering::SeqCst),
            history_id: event.history_id,
            name: event.name,
            step: event.name.step(),
            status: event.status,
            detail: event.detail,
            created_time: Utc::now(),
        };
        events.push(created.clone());
        Ok(created)
    }

    async fn list_publish_events(&self, history_id: i64) -> ReleaseResult<Vec<PublishEvent>> {
        self.state
            .read()
            .events
            .get(&history_id)
            .cloned()
            .ok_or_else(|| ReleaseError::not_found("ReleaseHistory", history_id))
    }
}
