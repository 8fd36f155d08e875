//! # Snapshot Store
//!
//! Freezes a gateway's live resources into immutable, monotonically
//! identified [`ResourceVersion`]s and tells whether the live definitions have
//! drifted from the latest one.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::error::ReleaseResult;
use crate::diff::{diff_records, ResourceDiff};
use crate::domain::{NewResourceVersion, ResourceRecord, ResourceVersion};
use crate::repository::ReleaseRepository;

/// Creates and reads resource version snapshots
pub struct SnapshotStore {
    repository: Arc<dyn ReleaseRepository>,
    /// Serializes "check drift, then create" within this process
    create_guard: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(repository: Arc<dyn ReleaseRepository>) -> Self {
        Self {
            repository,
            create_guard: Mutex::new(()),
        }
    }

    /// Materialize the live resources of a gateway, ordered by id
    pub async fn build_records(&self, gateway_id: i64) -> ReleaseResult<Vec<ResourceRecord>> {
        let backend_names: HashMap<i64, String> = self
            .repository
            .list_backends(gateway_id)
            .await?
            .into_iter()
            .map(|b| (b.id, b.name))
            .collect();

        let mut records: Vec<ResourceRecord> = self
            .repository
            .list_resources(gateway_id)
            .await?
            .iter()
            .map(|resource| {
                let backend_name = backend_names
                    .get(&resource.proxy.backend_id)
                    .map(String::as_str);
                ResourceRecord::from_resource(resource, backend_name)
            })
            .collect();
        records.sort_by_key(|r| r.id);

        Ok(records)
    }

    /// Changes between the latest version and the live resources
    ///
    /// With no version yet, every live resource counts as added.
    pub async fn drift(&self, gateway_id: i64) -> ReleaseResult<ResourceDiff> {
        let live = self.build_records(gateway_id).await?;
        let latest = self.repository.latest_resource_version(gateway_id).await?;
        let frozen = latest.map(|v| v.data).unwrap_or_default();
        diff_records(&frozen, &live)
    }

    /// Whether a release needs a fresh snapshot first
    pub async fn need_new_version(&self, gateway_id: i64) -> ReleaseResult<bool> {
        if self
            .repository
            .latest_resource_version(gateway_id)
            .await?
            .is_none()
        {
            return Ok(true);
        }
        Ok(!self.drift(gateway_id).await?.is_empty())
    }

    /// Persist a new immutable snapshot of the live resources
    pub async fn create_version(
        &self,
        gateway_id: i64,
        title: &str,
        comment: &str,
        operator: &str,
    ) -> ReleaseResult<ResourceVersion> {
        let data = self.build_records(gateway_id).await?;
        let sequence = self.repository.count_resource_versions(gateway_id).await? + 1;
        let version = format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), sequence);

        let created = self
            .repository
            .create_resource_version(NewResourceVersion {
                gateway_id,
                version,
                title: title.to_string(),
                comment: comment.to_string(),
                data,
                created_by: operator.to_string(),
            })
            .await?;

        info!(
            gateway_id,
            version_id = created.id,
            version = %created.version,
            resources = created.data.len(),
            "Resource version created"
        );

        Ok(created)
    }

    /// The latest version, creating one first if the live resources drifted
    ///
    /// Returns the version and whether it was just created.
    pub async fn ensure_latest_version(
        &self,
        gateway_id: i64,
        comment: &str,
        operator: &str,
    ) -> ReleaseResult<(ResourceVersion, bool)> {
        let _guard = self.create_guard.lock().await;

        if let Some(latest) = self.repository.latest_resource_version(gateway_id).await? {
            let live = self.build_records(gateway_id).await?;
            if diff_records(&latest.data, &live)?.is_empty() {
                debug!(gateway_id, version_id = latest.id, "No drift, reusing latest version");
                return Ok((latest, false));
            }
        }

        let created = self
            .create_version(gateway_id, "auto", comment, operator)
            .await?;
        Ok((created, true))
    }

    pub async fn get_version(&self, version_id: i64) -> ReleaseResult<ResourceVersion> {
        self.repository.get_resource_version(version_id).await
    }

    pub async fn latest_version(&self, gateway_id: i64) -> ReleaseResult<Option<ResourceVersion>> {
        self.repository.latest_resource_version(gateway_id).await
    }
}
