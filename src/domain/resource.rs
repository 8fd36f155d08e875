//! Resources and immutable resource-version snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::gateway::PluginBinding;

/// Schema of the records held in a [`ResourceVersion`]
///
/// Versions created before the last migration cannot be released anymore and
/// must be regenerated.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Authentication requirements of a resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceAuthConfig {
    #[serde(default)]
    pub verified_app_required: bool,
    #[serde(default)]
    pub verified_user_required: bool,
    #[serde(default)]
    pub resource_perm_required: bool,
    #[serde(default)]
    pub skip_auth_verification: bool,
}

/// How a resource forwards to its backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceProxyConfig {
    /// Backend id; `0` means unset
    #[serde(default)]
    pub backend_id: i64,
    /// Upstream method; empty means "same as the resource"
    #[serde(default)]
    pub method: String,
    /// Upstream path template
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub timeout_secs: Option<u32>,
}

/// One routable endpoint, as currently defined by administrators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub id: i64,
    pub gateway_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub match_subpath: bool,
    #[serde(default)]
    pub enable_websocket: bool,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default)]
    pub auth: ResourceAuthConfig,
    #[serde(default)]
    pub proxy: ResourceProxyConfig,
    #[serde(default)]
    pub plugins: Vec<PluginBinding>,
    /// Names of the stages this resource is not published to
    #[serde(default)]
    pub disabled_stages: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Proxy section of a snapshot record, with the backend name resolved
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProxyRecord {
    pub backend_id: i64,
    #[serde(default)]
    pub backend_name: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub timeout_secs: Option<u32>,
}

/// A fully-materialized resource, as frozen into a snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub match_subpath: bool,
    #[serde(default)]
    pub enable_websocket: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub auth: ResourceAuthConfig,
    #[serde(default)]
    pub proxy: ProxyRecord,
    #[serde(default)]
    pub plugins: Vec<PluginBinding>,
    #[serde(default)]
    pub disabled_stages: Vec<String>,
}

impl ResourceRecord {
    /// Freeze a live resource, resolving its backend name
    pub fn from_resource(resource: &Resource, backend_name: Option<&str>) -> Self {
        let mut plugins = resource.plugins.clone();
        plugins.sort_by(|a, b| a.plugin_type.cmp(&b.plugin_type));

        let mut disabled_stages = resource.disabled_stages.clone();
        disabled_stages.sort();

        Self {
            id: resource.id,
            name: resource.name.clone(),
            description: resource.description.clone(),
            method: resource.method.to_uppercase(),
            path: resource.path.clone(),
            match_subpath: resource.match_subpath,
            enable_websocket: resource.enable_websocket,
            is_public: resource.is_public,
            auth: resource.auth.clone(),
            proxy: ProxyRecord {
                backend_id: resource.proxy.backend_id,
                backend_name: backend_name.unwrap_or_default().to_string(),
                method: resource.proxy.method.to_uppercase(),
                path: resource.proxy.path.clone(),
                timeout_secs: resource.proxy.timeout_secs,
            },
            plugins,
            disabled_stages,
        }
    }

    /// Whether this record is excluded from the given stage
    pub fn is_disabled_for(&self, stage_name: &str) -> bool {
        self.disabled_stages.iter().any(|s| s == stage_name)
    }
}

/// An immutable snapshot of all resources of a gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceVersion {
    pub id: i64,
    pub gateway_id: i64,
    pub version: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    /// Ordered by resource id
    pub data: Vec<ResourceRecord>,
    #[serde(default)]
    pub created_by: String,
    pub created_time: DateTime<Utc>,
}

fn current_schema() -> u32 {
    CURRENT_SCHEMA_VERSION
}

impl ResourceVersion {
    pub fn predates(&self, min_schema_version: u32) -> bool {
        self.schema_version < min_schema_version
    }
}

/// Fields supplied when creating a new resource version
#[derive(Debug, Clone)]
pub struct NewResourceVersion {
    pub gateway_id: i64,
    pub version: String,
    pub title: String,
    pub comment: String,
    pub data: Vec<ResourceRecord>,
    pub created_by: String,
}
