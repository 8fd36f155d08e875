//! Publish events and release status derivation.
//!
//! A release history never stores its status. The status is a pure function
//! of the ordered, append-only event list, so the audit trail is the only
//! source of truth.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::core::error::ReleaseResult;
use crate::domain::{
    NewPublishEvent, PublishEvent, PublishEventName, PublishEventStatus, ReleaseStatus,
};
use crate::repository::ReleaseRepository;

/// Status of a history given its events in insertion order
///
/// No events is Pending; a trailing failure is Failure; a trailing success
/// of the final step is Success; anything else is still Doing.
pub fn derive_status(events: &[PublishEvent]) -> ReleaseStatus {
    match events.last() {
        None => ReleaseStatus::Pending,
        Some(last) => match last.status {
            PublishEventStatus::Failure => ReleaseStatus::Failure,
            PublishEventStatus::Success if last.name.is_final() => ReleaseStatus::Success,
            _ => ReleaseStatus::Doing,
        },
    }
}

/// Appends the events of one history
pub struct EventRecorder {
    repository: Arc<dyn ReleaseRepository>,
    history_id: i64,
}

impl EventRecorder {
    pub fn new(repository: Arc<dyn ReleaseRepository>, history_id: i64) -> Self {
        Self {
            repository,
            history_id,
        }
    }

    pub fn history_id(&self) -> i64 {
        self.history_id
    }

    pub async fn record(
        &self,
        name: PublishEventName,
        status: PublishEventStatus,
        detail: Value,
    ) -> ReleaseResult<PublishEvent> {
        let event = self
            .repository
            .add_publish_event(NewPublishEvent {
                history_id: self.history_id,
                name,
                status,
                detail,
            })
            .await?;
        debug!(
            history_id = self.history_id,
            step = event.step,
            event = name.as_str(),
            status = ?status,
            "Publish event recorded"
        );
        Ok(event)
    }

    pub async fn start(&self, name: PublishEventName) -> ReleaseResult<PublishEvent> {
        self.record(name, PublishEventStatus::Doing, Value::Null).await
    }

    pub async fn succeed(&self, name: PublishEventName, detail: Value) -> ReleaseResult<PublishEvent> {
        self.record(name, PublishEventStatus::Success, detail).await
    }

    pub async fn fail(&self, name: PublishEventName, detail: Value) -> ReleaseResult<PublishEvent> {
        self.record(name, PublishEventStatus::Failure, detail).await
    }

    pub async fn status(&self) -> ReleaseResult<ReleaseStatus> {
        let events = self.repository.list_publish_events(self.history_id).await?;
        Ok(derive_status(&events))
    }
}
