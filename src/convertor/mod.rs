//! # Domain-to-DataPlane Convertor
//!
//! Projects a frozen resource version onto the records the data plane
//! consumes: one [`Route`] per resource released to a stage and one
//! [`Service`] per backend those resources use. Conversion is pure; all
//! inputs are loaded up front into a [`ReleaseData`].
//!
//! ## Module Organization
//! - `types`: data-plane record types
//! - `uri`: path template rendering and route priority
//! - `plugin`: plugin configuration validation and conversion
//! - `route`: resource → route
//! - `service`: backend → service
//! - `global`: gateway-independent plugin metadata

pub mod global;
pub mod plugin;
pub mod route;
pub mod service;
pub mod types;
pub mod uri;

pub use global::GlobalResourceConvertor;
pub use plugin::{PluginKind, PluginRegistry};
pub use route::RouteConvertor;
pub use service::{service_id, ServiceConvertor};
pub use types::{
    DataPlaneRecord, PluginMetadata, RecordKind, Route, Service, Upstream, UpstreamNode,
    UpstreamTimeout,
};

use std::collections::BTreeMap;

use crate::core::error::ReleaseResult;
use crate::domain::{
    Backend, BackendConfig, Gateway, PluginBinding, ResourceRecord, ResourceVersion, Stage,
};
use crate::repository::ReleaseRepository;

/// A backend with its configuration for the released stage
#[derive(Debug, Clone)]
pub struct BackendBinding {
    pub backend: Backend,
    /// `None` when the backend was never configured for the stage
    pub config: Option<BackendConfig>,
}

/// Everything needed to convert one (gateway, stage) release
#[derive(Debug, Clone)]
pub struct ReleaseData {
    pub gateway: Gateway,
    pub stage: Stage,
    /// `None` when the stage has never been released
    pub resource_version: Option<ResourceVersion>,
    pub backends: BTreeMap<i64, BackendBinding>,
    pub stage_plugins: Vec<PluginBinding>,
}

impl ReleaseData {
    /// Load release inputs from the repository
    ///
    /// Without an explicit version, the version currently released to the
    /// stage is used.
    pub async fn load(
        repository: &dyn ReleaseRepository,
        gateway_id: i64,
        stage_id: i64,
        resource_version_id: Option<i64>,
    ) -> ReleaseResult<Self> {
        let gateway = repository.get_gateway(gateway_id).await?;
        let stage = repository.get_stage(stage_id).await?;

        let version_id = match resource_version_id {
            Some(id) => Some(id),
            None => repository
                .get_release(gateway_id, stage_id)
                .await?
                .map(|release| release.resource_version_id),
        };
        let resource_version = match version_id {
            Some(id) => Some(repository.get_resource_version(id).await?),
            None => None,
        };

        let mut backends = BTreeMap::new();
        for backend in repository.list_backends(gateway_id).await? {
            let config = repository.get_backend_config(stage_id, backend.id).await?;
            backends.insert(backend.id, BackendBinding { backend, config });
        }

        let stage_plugins = repository.list_stage_plugins(stage_id).await?;

        Ok(Self {
            gateway,
            stage,
            resource_version,
            backends,
            stage_plugins,
        })
    }

    /// Records released to this stage, ordered by id
    pub fn active_records(&self) -> impl Iterator<Item = &ResourceRecord> {
        let stage = self.stage.name.as_str();
        self.resource_version
            .iter()
            .flat_map(|version| version.data.iter())
            .filter(move |record| !record.is_disabled_for(stage))
    }

    /// `{gateway}.{stage}`, the prefix of every record id of this release
    pub fn id_prefix(&self) -> String {
        format!("{}.{}", self.gateway.name, self.stage.name)
    }

    /// Labels shared by every record of this release
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("gateway".to_string(), self.gateway.name.clone());
        labels.insert("stage".to_string(), self.stage.name.clone());
        labels
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::domain::{Status, Stage};
    use crate::repository::InMemoryRepository;

    #[test]
    fn test_active_records_skip_disabled_stage() {
        let mut hidden = record(2, "GET", "/hidden");
        hidden.disabled_stages = vec!["prod".to_string()];
        let data = release_data(vec![record(1, "GET", "/a"), hidden]);

        let ids: Vec<i64> = data.active_records().map(|r| r.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_load_without_release_has_no_version() {
        let repo = InMemoryRepository::new();
        repo.upsert_gateway(Gateway {
            id: 1,
            name: "demo".to_string(),
            status: Status::Active,
            is_programmable: false,
            tenant_id: None,
        });
        repo.upsert_stage(Stage {
            id: 2,
            gateway_id: 1,
            name: "prod".to_string(),
            status: Status::Active,
            vars: BTreeMap::new(),
        });

        let data = ReleaseData::load(&repo, 1, 2, None).await.unwrap();
        assert!(data.resource_version.is_none());
        assert_eq!(data.active_records().count(), 0);
        assert_eq!(data.id_prefix(), "demo.prod");
    }
}
