//! # Repository
//!
//! Persistence collaborator of the release pipeline. The pipeline only needs
//! create/read/update-by-id semantics on gateway entities, resource versions,
//! releases, release histories and publish events; any storage engine that
//! offers them can implement [`ReleaseRepository`].
//!
//! Publish events are append-only: the trait has no way to update or delete one.

pub mod memory;

pub use memory::{InMemoryRepository, RepositorySeed};

use async_trait::async_trait;

use crate::core::error::ReleaseResult;
use crate::domain::{
    Backend, BackendConfig, Gateway, NewPublishEvent, NewReleaseHistory, NewResourceVersion,
    PluginBinding, PublishEvent, Release, ReleaseHistory, Resource, ResourceVersion, Stage,
};

/// Storage operations used by the release pipeline
#[async_trait]
pub trait ReleaseRepository: Send + Sync {
    async fn get_gateway(&self, gateway_id: i64) -> ReleaseResult<Gateway>;

    async fn list_gateways(&self) -> ReleaseResult<Vec<Gateway>>;

    async fn get_stage(&self, stage_id: i64) -> ReleaseResult<Stage>;

    async fn list_stages(&self, gateway_id: i64) -> ReleaseResult<Vec<Stage>>;

    /// Live resources of a gateway, ordered by id
    async fn list_resources(&self, gateway_id: i64) -> ReleaseResult<Vec<Resource>>;

    async fn list_backends(&self, gateway_id: i64) -> ReleaseResult<Vec<Backend>>;

    async fn get_backend_config(
        &self,
        stage_id: i64,
        backend_id: i64,
    ) -> ReleaseResult<Option<BackendConfig>>;

    /// Plugins bound at stage scope
    async fn list_stage_plugins(&self, stage_id: i64) -> ReleaseResult<Vec<PluginBinding>>;

    async fn create_resource_version(
        &self,
        version: NewResourceVersion,
    ) -> ReleaseResult<ResourceVersion>;

    async fn get_resource_version(&self, version_id: i64) -> ReleaseResult<ResourceVersion>;

    /// Most recently created version of a gateway
    async fn latest_resource_version(&self, gateway_id: i64)
        -> ReleaseResult<Option<ResourceVersion>>;

    async fn count_resource_versions(&self, gateway_id: i64) -> ReleaseResult<usize>;

    async fn get_release(&self, gateway_id: i64, stage_id: i64) -> ReleaseResult<Option<Release>>;

    /// Point a stage at a resource version; there is at most one release per (gateway, stage)
    async fn upsert_release(
        &self,
        gateway_id: i64,
        stage_id: i64,
        resource_version_id: i64,
        operator: &str,
    ) -> ReleaseResult<Release>;

    async fn create_release_history(
        &self,
        history: NewReleaseHistory,
    ) -> ReleaseResult<ReleaseHistory>;

    async fn get_release_history(&self, history_id: i64) -> ReleaseResult<ReleaseHistory>;

    /// Histories of a gateway, most recent first
    async fn list_release_histories(&self, gateway_id: i64) -> ReleaseResult<Vec<ReleaseHistory>>;

    async fn add_publish_event(&self, event: NewPublishEvent) -> ReleaseResult<PublishEvent>;

    /// Events of a history, in insertion order
    async fn list_publish_events(&self, history_id: i64) -> ReleaseResult<Vec<PublishEvent>>;
}
