//! Data-plane resource records.
//!
//! Maps are `BTreeMap`s so that serializing the same record twice yields the
//! same bytes; the distributor relies on this to skip unchanged keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::error::ReleaseResult;

/// Kind of a data-plane record, also the key segment it is stored under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Route,
    Service,
    PluginMetadata,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::Service => "service",
            Self::PluginMetadata => "plugin_metadata",
        }
    }
}

/// Something the distributor can write into the store
pub trait DataPlaneRecord: Serialize {
    fn kind(&self) -> RecordKind;

    fn record_id(&self) -> &str;

    /// Store value of this record
    fn to_bytes(&self) -> ReleaseResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Upstream timeouts in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpstreamTimeout {
    pub connect: u32,
    pub send: u32,
    pub read: u32,
}

impl UpstreamTimeout {
    pub fn uniform(seconds: u32) -> Self {
        Self {
            connect: seconds,
            send: seconds,
            read: seconds,
        }
    }
}

/// One upstream host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpstreamNode {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub priority: i32,
}

/// Upstream target group of a service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upstream {
    /// `roundrobin` or `chash`
    #[serde(rename = "type")]
    pub lb_type: String,
    pub scheme: String,
    pub nodes: Vec<UpstreamNode>,
    pub timeout: UpstreamTimeout,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Data-plane projection of a resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub id: String,
    pub name: String,
    pub uris: Vec<String>,
    /// Empty means any method
    pub methods: Vec<String>,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub enable_websocket: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<UpstreamTimeout>,
    pub plugins: BTreeMap<String, Value>,
    pub labels: BTreeMap<String, String>,
}

impl DataPlaneRecord for Route {
    fn kind(&self) -> RecordKind {
        RecordKind::Route
    }

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Data-plane projection of a backend within a stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub upstream: Upstream,
    pub plugins: BTreeMap<String, Value>,
    pub labels: BTreeMap<String, String>,
}

impl DataPlaneRecord for Service {
    fn kind(&self) -> RecordKind {
        RecordKind::Service
    }

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Plugin metadata shared by every gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginMetadata {
    /// Plugin name
    pub id: String,
    pub config: Value,
}

impl DataPlaneRecord for PluginMetadata {
    fn kind(&self) -> RecordKind {
        RecordKind::PluginMetadata
    }

    fn record_id(&self) -> &str {
        &self.id
    }
}
