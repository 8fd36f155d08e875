//! Post-publish side effects.
//!
//! Hooks run after the lock is released. They are best effort: a failing
//! hook is logged and never changes the recorded outcome of the release.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::core::error::ReleaseResult;
use crate::domain::{Gateway, PublishSource, ReleaseStatus, Stage};

/// What a hook is told about a finished publish
#[derive(Debug, Clone)]
pub struct PublishNotice {
    pub gateway: Gateway,
    pub stage: Stage,
    pub source: PublishSource,
    pub status: ReleaseStatus,
    pub history_id: Option<i64>,
    /// The stage's records were removed rather than published
    pub revoked: bool,
}

#[async_trait]
pub trait PostPublishHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn after_publish(&self, notice: &PublishNotice) -> ReleaseResult<()>;
}

/// Deployment control of a programmable gateway's backend
#[async_trait]
pub trait ProgrammableBackendClient: Send + Sync {
    /// Stop serving the deployed backend of `gateway` in `stage`
    async fn offline(&self, gateway: &str, stage: &str) -> ReleaseResult<()>;
}

/// Takes a programmable gateway's backend offline once its stage is disabled
pub struct ProgrammableGatewayHook {
    client: Arc<dyn ProgrammableBackendClient>,
}

impl ProgrammableGatewayHook {
    pub fn new(client: Arc<dyn ProgrammableBackendClient>) -> Self {
        Self { client }
    }

    fn applies(notice: &PublishNotice) -> bool {
        notice.gateway.is_programmable
            && notice.source.is_disable()
            && notice.status == ReleaseStatus::Success
    }
}

#[async_trait]
impl PostPublishHook for ProgrammableGatewayHook {
    fn name(&self) -> &'static str {
        "programmable_gateway_offline"
    }

    async fn after_publish(&self, notice: &PublishNotice) -> ReleaseResult<()> {
        if !Self::applies(notice) {
            return Ok(());
        }

        self.client
            .offline(&notice.gateway.name, &notice.stage.name)
            .await?;
        info!(
            gateway = %notice.gateway.name,
            stage = %notice.stage.name,
            source = %notice.source,
            "Programmable backend taken offline"
        );
        Ok(())
    }
}
