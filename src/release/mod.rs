//! # Release Orchestrator
//!
//! Drives a publish through its fixed steps and records each one as an
//! append-only [`PublishEvent`]:
//!
//! 1. `check_readiness`: gateway and stage exist and are active (some
//!    system sources bypass the active checks)
//! 2. `select_version`: the requested resource version, or the latest one
//!    (snapshotting live resources first if they drifted)
//! 3. `create_history`: the audit record, written before anything is distributed
//! 4. `distribute_configuration`: reconcile the stage's records into the store
//! 5. `switch_release`: point the stage at the version, only after step 4 succeeded
//! 6. `finalize_history`: terminal success or failure
//!
//! Failures before step 3 leave no history behind. Once a history exists,
//! it always ends with a terminal event. Steps 2 to 6 run under a
//! per-(gateway, stage) lock that is released on every path.
//!
//! ## Module Organization
//! - `events`: event recording and status derivation
//! - `hooks`: best-effort post-publish side effects
//! - `batch`: drift reconciliation across all active stages

pub mod batch;
pub mod events;
pub mod hooks;

pub use batch::{BatchFailure, BatchOptions, BatchReconciler, BatchReport, StageDrift};
pub use events::{derive_status, EventRecorder};
pub use hooks::{PostPublishHook, ProgrammableBackendClient, ProgrammableGatewayHook, PublishNotice};

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::convertor::ReleaseData;
use crate::core::config::ReleaseSettings;
use crate::core::error::{ReleaseError, ReleaseResult};
use crate::diff::ResourceDiffer;
use crate::distributor::Distributor;
use crate::domain::{
    Gateway, NewReleaseHistory, PublishEvent, PublishEventName, PublishId, PublishSource,
    ReleaseHistory, ReleaseStatus, ResourceVersion, Stage,
};
use crate::lock::{lock_key, LockLease, ReleaseLock};
use crate::observability::metrics;
use crate::repository::ReleaseRepository;
use crate::snapshot::SnapshotStore;

/// A request to publish resources to one or more stages of a gateway
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub gateway_id: i64,
    pub stage_ids: Vec<i64>,
    /// `None` publishes the latest version, creating one if resources drifted
    pub resource_version_id: Option<i64>,
    pub comment: String,
    pub operator: String,
    pub source: PublishSource,
}

/// A request to remove the published records of one or more stages
#[derive(Debug, Clone)]
pub struct RevokeRequest {
    pub gateway_id: i64,
    pub stage_ids: Vec<i64>,
    pub comment: String,
    pub operator: String,
    pub source: PublishSource,
    /// Drop the whole key prefix instead of reconciling it to empty
    pub delete_all: bool,
}

/// Result of publishing to one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageReleaseOutcome {
    pub stage_id: i64,
    /// `None` when the publish was rejected before a history was created
    pub history_id: Option<i64>,
    pub resource_version_id: Option<i64>,
    pub status: ReleaseStatus,
    pub message: String,
    pub error: Option<ReleaseError>,
}

impl StageReleaseOutcome {
    fn rejected(stage_id: i64, error: ReleaseError) -> Self {
        Self {
            stage_id,
            history_id: None,
            resource_version_id: None,
            status: ReleaseStatus::Failure,
            message: error.to_string(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReleaseStatus::Success
    }
}

/// A release history with its events and derived status
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseHistoryView {
    pub history: ReleaseHistory,
    pub events: Vec<PublishEvent>,
    pub status: ReleaseStatus,
    /// Resource changes against the previously released version
    pub diff_summary: Option<Vec<String>>,
}

impl ReleaseHistoryView {
    /// True when this history took the stage's records down instead of publishing
    pub fn is_revoke(&self) -> bool {
        self.events
            .iter()
            .find(|e| e.name == PublishEventName::CheckReadiness)
            .and_then(|e| e.detail.get("revoke"))
            .and_then(|revoke| revoke.as_bool())
            .unwrap_or(false)
    }
}

/// What a stage publish does once its history exists
enum Action<'a> {
    Publish(&'a ResourceVersion),
    Revoke { delete_all: bool },
}

pub struct Releaser {
    repository: Arc<dyn ReleaseRepository>,
    snapshots: Arc<SnapshotStore>,
    distributor: Arc<Distributor>,
    lock: Arc<ReleaseLock>,
    settings: ReleaseSettings,
    hooks: Vec<Arc<dyn PostPublishHook>>,
}

impl Releaser {
    pub fn new(
        repository: Arc<dyn ReleaseRepository>,
        snapshots: Arc<SnapshotStore>,
        distributor: Arc<Distributor>,
        lock: Arc<ReleaseLock>,
        settings: ReleaseSettings,
    ) -> Self {
        Self {
            repository,
            snapshots,
            distributor,
            lock,
            settings,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostPublishHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Publish to every requested stage in order
    ///
    /// A stage failing does not stop the others; each gets its own outcome.
    pub async fn release(&self, request: &ReleaseRequest) -> ReleaseResult<Vec<StageReleaseOutcome>> {
        if request.stage_ids.is_empty() {
            return Err(ReleaseError::precondition("release has no stage"));
        }

        let mut outcomes = Vec::with_capacity(request.stage_ids.len());
        for &stage_id in &request.stage_ids {
            let outcome = self.release_stage(request, stage_id).await;
            metrics::record_publish(outcome.status);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Remove the published records of every requested stage
    ///
    /// The release binding of each stage is left as is, so a later publish
    /// without an explicit version restores the same version.
    pub async fn revoke(&self, request: &RevokeRequest) -> ReleaseResult<Vec<StageReleaseOutcome>> {
        if request.stage_ids.is_empty() {
            return Err(ReleaseError::precondition("revoke has no stage"));
        }

        let mut outcomes = Vec::with_capacity(request.stage_ids.len());
        for &stage_id in &request.stage_ids {
            let outcome = self.revoke_stage(request, stage_id).await;
            metrics::record_publish(outcome.status);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub async fn history_view(&self, history_id: i64) -> ReleaseResult<ReleaseHistoryView> {
        let history = self.repository.get_release_history(history_id).await?;
        self.view(history).await
    }

    /// Histories of a gateway, most recent first
    pub async fn list_histories(&self, gateway_id: i64) -> ReleaseResult<Vec<ReleaseHistoryView>> {
        let histories = self.repository.list_release_histories(gateway_id).await?;
        let mut views = Vec::with_capacity(histories.len());
        for history in histories {
            views.push(self.view(history).await?);
        }
        Ok(views)
    }

    /// Whether the last successful publish of a stage took its records down
    pub async fn is_revoked(&self, gateway_id: i64, stage_id: i64) -> ReleaseResult<bool> {
        let histories = self.repository.list_release_histories(gateway_id).await?;
        for history in histories.into_iter().filter(|h| h.stage_id == stage_id) {
            let view = self.view(history).await?;
            if view.status == ReleaseStatus::Success {
                return Ok(view.is_revoke());
            }
        }
        Ok(false)
    }

    async fn view(&self, history: ReleaseHistory) -> ReleaseResult<ReleaseHistoryView> {
        let events = self.repository.list_publish_events(history.id).await?;
        let status = derive_status(&events);
        let diff_summary = events
            .iter()
            .find(|e| e.name == PublishEventName::CreateHistory)
            .and_then(|e| e.detail.get("diff"))
            .and_then(|diff| serde_json::from_value(diff.clone()).ok());

        Ok(ReleaseHistoryView {
            history,
            events,
            status,
            diff_summary,
        })
    }

    async fn release_stage(&self, request: &ReleaseRequest, stage_id: i64) -> StageReleaseOutcome {
        let (gateway, stage) = match self
            .check_readiness(request.gateway_id, stage_id, request.source, false)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(gateway_id = request.gateway_id, stage_id, error = %e, "Release rejected");
                return StageReleaseOutcome::rejected(stage_id, e);
            }
        };

        let lease = match self.lock.acquire(&lock_key(gateway.id, stage.id)).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(gateway = %gateway.name, stage = %stage.name, error = %e, "Release lock not acquired");
                return StageReleaseOutcome::rejected(stage_id, e);
            }
        };

        let outcome = match self.select_version(request, &gateway).await {
            Ok(version) => {
                self.run(
                    &gateway,
                    &stage,
                    request.source,
                    &request.comment,
                    &request.operator,
                    Action::Publish(&version),
                )
                .await
            }
            Err(e) => {
                warn!(gateway = %gateway.name, stage = %stage.name, error = %e, "No releasable version");
                StageReleaseOutcome::rejected(stage_id, e)
            }
        };

        self.release_lease(lease).await;
        self.notify(&gateway, &stage, request.source, &outcome, false).await;
        outcome
    }

    async fn revoke_stage(&self, request: &RevokeRequest, stage_id: i64) -> StageReleaseOutcome {
        let (gateway, stage) = match self
            .check_readiness(request.gateway_id, stage_id, request.source, true)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(gateway_id = request.gateway_id, stage_id, error = %e, "Revoke rejected");
                return StageReleaseOutcome::rejected(stage_id, e);
            }
        };

        let lease = match self.lock.acquire(&lock_key(gateway.id, stage.id)).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(gateway = %gateway.name, stage = %stage.name, error = %e, "Release lock not acquired");
                return StageReleaseOutcome::rejected(stage_id, e);
            }
        };

        let outcome = self
            .run(
                &gateway,
                &stage,
                request.source,
                &request.comment,
                &request.operator,
                Action::Revoke {
                    delete_all: request.delete_all,
                },
            )
            .await;

        self.release_lease(lease).await;
        self.notify(&gateway, &stage, request.source, &outcome, true).await;
        outcome
    }

    /// Gateway and stage of a publish
    ///
    /// Active checks are skipped for revocations and for the configured
    /// bypass sources.
    async fn check_readiness(
        &self,
        gateway_id: i64,
        stage_id: i64,
        source: PublishSource,
        revoking: bool,
    ) -> ReleaseResult<(Gateway, Stage)> {
        let gateway = self.repository.get_gateway(gateway_id).await?;
        let stage = self.repository.get_stage(stage_id).await?;

        if stage.gateway_id != gateway.id {
            return Err(ReleaseError::precondition(format!(
                "stage {} does not belong to gateway {}",
                stage.name, gateway.name
            )));
        }

        if revoking || self.settings.bypasses_status_checks(source) {
            return Ok((gateway, stage));
        }
        if !gateway.status.is_active() {
            return Err(ReleaseError::precondition(format!(
                "gateway {} is inactive",
                gateway.name
            )));
        }
        if !stage.status.is_active() {
            return Err(ReleaseError::precondition(format!(
                "stage {} is inactive",
                stage.name
            )));
        }
        Ok((gateway, stage))
    }

    async fn select_version(
        &self,
        request: &ReleaseRequest,
        gateway: &Gateway,
    ) -> ReleaseResult<ResourceVersion> {
        let version = match request.resource_version_id {
            Some(id) => {
                let version = self.snapshots.get_version(id).await?;
                if version.gateway_id != gateway.id {
                    return Err(ReleaseError::precondition(format!(
                        "resource version {} does not belong to gateway {}",
                        id, gateway.name
                    )));
                }
                version
            }
            None => {
                let (version, created) = self
                    .snapshots
                    .ensure_latest_version(gateway.id, &request.comment, &request.operator)
                    .await?;
                if created {
                    info!(gateway = %gateway.name, version = %version.version, "Snapshot created for release");
                }
                version
            }
        };

        if version.predates(self.settings.min_schema_version) {
            return Err(ReleaseError::precondition(format!(
                "resource version {} has schema {} older than {}, create a new version first",
                version.version, version.schema_version, self.settings.min_schema_version
            )));
        }
        Ok(version)
    }

    /// Changes between the stage's current version and `version`
    async fn diff_summary(
        &self,
        gateway_id: i64,
        stage_id: i64,
        version: &ResourceVersion,
    ) -> ReleaseResult<Vec<String>> {
        let current = match self.repository.get_release(gateway_id, stage_id).await? {
            Some(release) if release.resource_version_id == version.id => return Ok(Vec::new()),
            Some(release) => self
                .repository
                .get_resource_version(release.resource_version_id)
                .await?
                .data,
            None => Vec::new(),
        };
        Ok(ResourceDiffer::diff(&current, &version.data)?.summary())
    }

    /// Steps 3 to 6, under the lock
    async fn run(
        &self,
        gateway: &Gateway,
        stage: &Stage,
        source: PublishSource,
        comment: &str,
        operator: &str,
        action: Action<'_>,
    ) -> StageReleaseOutcome {
        let version_id = match &action {
            Action::Publish(version) => Some(version.id),
            Action::Revoke { .. } => match self.repository.get_release(gateway.id, stage.id).await {
                Ok(release) => release.map(|release| release.resource_version_id),
                Err(e) => return StageReleaseOutcome::rejected(stage.id, e),
            },
        };

        let data = match ReleaseData::load(self.repository.as_ref(), gateway.id, stage.id, version_id).await {
            Ok(data) => data,
            Err(e) => return StageReleaseOutcome::rejected(stage.id, e),
        };

        let diff = match &action {
            Action::Publish(version) => self
                .diff_summary(gateway.id, stage.id, version)
                .await
                .unwrap_or_else(|e| {
                    warn!(gateway = %gateway.name, stage = %stage.name, error = %e, "Failed to diff against current release");
                    Vec::new()
                }),
            Action::Revoke { .. } => Vec::new(),
        };

        let history = match self
            .repository
            .create_release_history(NewReleaseHistory {
                gateway_id: gateway.id,
                stage_id: stage.id,
                resource_version_id: version_id,
                source,
                comment: comment.to_string(),
                created_by: operator.to_string(),
            })
            .await
        {
            Ok(history) => history,
            Err(e) => return StageReleaseOutcome::rejected(stage.id, e),
        };

        let recorder = EventRecorder::new(self.repository.clone(), history.id);
        let task_id = Uuid::new_v4().to_string();
        info!(
            gateway = %gateway.name,
            stage = %stage.name,
            history_id = history.id,
            task_id = %task_id,
            source = %source,
            "Publish started"
        );

        let result = self
            .run_steps(&recorder, &data, &action, source, operator, &diff, &task_id)
            .await;

        let (status, message, error) = match result {
            Ok(message) => {
                match recorder
                    .succeed(PublishEventName::FinalizeHistory, json!({"message": message}))
                    .await
                {
                    Ok(_) => (ReleaseStatus::Success, message, None),
                    Err(e) => (ReleaseStatus::Failure, e.to_string(), Some(e)),
                }
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(record_err) = recorder
                    .fail(PublishEventName::FinalizeHistory, json!({"message": message}))
                    .await
                {
                    error!(history_id = history.id, error = %record_err, "Failed to finalize release history");
                }
                (ReleaseStatus::Failure, message, Some(e))
            }
        };

        info!(
            gateway = %gateway.name,
            stage = %stage.name,
            history_id = history.id,
            task_id = %task_id,
            status = status.as_str(),
            "Publish finished"
        );

        StageReleaseOutcome {
            stage_id: stage.id,
            history_id: Some(history.id),
            resource_version_id: version_id,
            status,
            message,
            error,
        }
    }

    /// Steps 1 to 5 as events; returns the distribution message
    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        recorder: &EventRecorder,
        data: &ReleaseData,
        action: &Action<'_>,
        source: PublishSource,
        operator: &str,
        diff: &[String],
        task_id: &str,
    ) -> ReleaseResult<String> {
        let revoking = matches!(action, Action::Revoke { .. });

        recorder
            .succeed(
                PublishEventName::CheckReadiness,
                json!({"source": source, "revoke": revoking}),
            )
            .await?;
        recorder
            .succeed(
                PublishEventName::SelectVersion,
                json!({
                    "resource_version_id": data.resource_version.as_ref().map(|v| v.id),
                    "version": data.resource_version.as_ref().map(|v| v.version.clone()),
                }),
            )
            .await?;
        recorder
            .succeed(
                PublishEventName::CreateHistory,
                json!({"history_id": recorder.history_id(), "diff": diff}),
            )
            .await?;

        recorder.start(PublishEventName::DistributeConfiguration).await?;
        let outcome = match action {
            Action::Publish(_) => {
                self.distributor
                    .distribute(data, PublishId(recorder.history_id()), task_id)
                    .await
            }
            Action::Revoke { delete_all } => {
                let publish_id = if *delete_all {
                    PublishId::DELETE
                } else {
                    PublishId(recorder.history_id())
                };
                self.distributor.revoke(data, publish_id, task_id).await
            }
        };

        if !outcome.ok {
            recorder
                .fail(
                    PublishEventName::DistributeConfiguration,
                    json!({"message": outcome.message}),
                )
                .await?;
            return Err(ReleaseError::store(outcome.message));
        }
        recorder
            .succeed(
                PublishEventName::DistributeConfiguration,
                json!({"message": outcome.message}),
            )
            .await?;

        if let Action::Publish(version) = action {
            recorder.start(PublishEventName::SwitchRelease).await?;
            if let Err(e) = self
                .repository
                .upsert_release(data.gateway.id, data.stage.id, version.id, operator)
                .await
            {
                recorder
                    .fail(PublishEventName::SwitchRelease, json!({"message": e.to_string()}))
                    .await?;
                return Err(e);
            }
            recorder
                .succeed(
                    PublishEventName::SwitchRelease,
                    json!({"resource_version_id": version.id}),
                )
                .await?;
        }

        Ok(outcome.message)
    }

    async fn release_lease(&self, lease: LockLease) {
        let key = lease.key.clone();
        if let Err(e) = self.lock.release(lease).await {
            error!(key = %key, error = %e, "Failed to release lock");
        }
    }

    async fn notify(
        &self,
        gateway: &Gateway,
        stage: &Stage,
        source: PublishSource,
        outcome: &StageReleaseOutcome,
        revoked: bool,
    ) {
        if self.hooks.is_empty() {
            return;
        }

        let notice = PublishNotice {
            gateway: gateway.clone(),
            stage: stage.clone(),
            source,
            status: outcome.status,
            history_id: outcome.history_id,
            revoked,
        };
        for hook in &self.hooks {
            if let Err(e) = hook.after_publish(&notice).await {
                warn!(
                    hook = hook.name(),
                    gateway = %gateway.name,
                    stage = %stage.name,
                    error = %e,
                    "Post-publish hook failed"
                );
            }
        }
    }
}
