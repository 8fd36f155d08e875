//! Release bindings, release history and publish events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a publish attempt as seen by the distributor and the data plane
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct PublishId(pub i64);

impl PublishId {
    /// Publishes that must not report events back (batch/maintenance runs)
    pub const NO_REPORT: PublishId = PublishId(-1);

    /// Revocations that drop the whole key prefix without conversion
    pub const DELETE: PublishId = PublishId(-2);

    pub fn is_delete(&self) -> bool {
        *self == Self::DELETE
    }
}

impl fmt::Display for PublishId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What triggered a publish
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PublishSource {
    VersionPublish,
    GatewayEnable,
    GatewayDisable,
    GatewayDelete,
    StageDisable,
    StageUpdate,
    BackendUpdate,
    PluginBind,
    PluginUnbind,
    CliSync,
}

impl PublishSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VersionPublish => "version_publish",
            Self::GatewayEnable => "gateway_enable",
            Self::GatewayDisable => "gateway_disable",
            Self::GatewayDelete => "gateway_delete",
            Self::StageDisable => "stage_disable",
            Self::StageUpdate => "stage_update",
            Self::BackendUpdate => "backend_update",
            Self::PluginBind => "plugin_bind",
            Self::PluginUnbind => "plugin_unbind",
            Self::CliSync => "cli_sync",
        }
    }

    /// Sources that take a gateway or stage offline
    pub fn is_disable(&self) -> bool {
        matches!(
            self,
            Self::GatewayDisable | Self::GatewayDelete | Self::StageDisable
        )
    }
}

impl fmt::Display for PublishSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The current (gateway, stage) → resource version binding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    pub gateway_id: i64,
    pub stage_id: i64,
    pub resource_version_id: i64,
    pub updated_by: String,
    pub updated_time: DateTime<Utc>,
}

/// Append-only audit record of one publish attempt
///
/// The status is not stored here; it is derived from the publish events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseHistory {
    pub id: i64,
    pub gateway_id: i64,
    pub stage_id: i64,
    pub resource_version_id: Option<i64>,
    pub source: PublishSource,
    pub comment: String,
    pub created_by: String,
    pub created_time: DateTime<Utc>,
}

/// Fields supplied when creating a release history
#[derive(Debug, Clone)]
pub struct NewReleaseHistory {
    pub gateway_id: i64,
    pub stage_id: i64,
    pub resource_version_id: Option<i64>,
    pub source: PublishSource,
    pub comment: String,
    pub created_by: String,
}

/// Fixed, ordered steps of a publish
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PublishEventName {
    CheckReadiness,
    SelectVersion,
    CreateHistory,
    DistributeConfiguration,
    SwitchRelease,
    FinalizeHistory,
}

impl PublishEventName {
    pub const ALL: [PublishEventName; 6] = [
        Self::CheckReadiness,
        Self::SelectVersion,
        Self::CreateHistory,
        Self::DistributeConfiguration,
        Self::SwitchRelease,
        Self::FinalizeHistory,
    ];

    /// 1-based step number
    pub fn step(&self) -> u32 {
        match self {
            Self::CheckReadiness => 1,
            Self::SelectVersion => 2,
            Self::CreateHistory => 3,
            Self::DistributeConfiguration => 4,
            Self::SwitchRelease => 5,
            Self::FinalizeHistory => 6,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::FinalizeHistory)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckReadiness => "check_readiness",
            Self::SelectVersion => "select_version",
            Self::CreateHistory => "create_history",
            Self::DistributeConfiguration => "distribute_configuration",
            Self::SwitchRelease => "switch_release",
            Self::FinalizeHistory => "finalize_history",
        }
    }
}

/// Status of a single publish step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PublishEventStatus {
    Doing,
    Success,
    Failure,
}

/// Overall status of a release history, derived from its events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Doing,
    Success,
    Failure,
}

impl ReleaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Doing => "doing",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// One step within a release history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishEvent {
    pub id: i64,
    pub history_id: i64,
    pub name: PublishEventName,
    pub step: u32,
    pub status: PublishEventStatus,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub created_time: DateTime<Utc>,
}

/// Fields supplied when appending a publish event
#[derive(Debug, Clone)]
pub struct NewPublishEvent {
    pub history_id: i64,
    pub name: PublishEventName,
    pub status: PublishEventStatus,
    pub detail: serde_json::Value,
}
