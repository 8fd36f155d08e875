//! Gateway, stage and backend definitions.
//!
//! These are owned by the administrative surface; the release pipeline only
//! reads them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Activation status shared by gateways and stages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Active,
    Inactive,
}

impl Status {
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Active)
    }
}

/// A tenant's top-level gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gateway {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub status: Status,
    /// Programmable gateways own a deployable backend that follows the gateway lifecycle
    #[serde(default)]
    pub is_programmable: bool,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// An environment (prod, test, ...) within a gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    pub id: i64,
    pub gateway_id: i64,
    pub name: String,
    #[serde(default)]
    pub status: Status,
    /// Stage variables, substituted into `{env.NAME}` path placeholders
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// A named upstream target group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backend {
    pub id: i64,
    pub gateway_id: i64,
    pub name: String,
}

/// Load-balancing policy of a backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalance {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    Chash,
}

/// A single upstream host of a backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendHost {
    /// `http` or `https`
    pub scheme: String,
    /// Host with an optional explicit port, e.g. `10.0.0.1:8080` or `api.example.com`
    pub host: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    100
}

/// Stage-specific configuration of a backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub backend_id: i64,
    pub stage_id: i64,
    #[serde(default)]
    pub load_balance: LoadBalance,
    /// Hash source for `chash` (`header`, `cookie`, `vars`)
    #[serde(default)]
    pub hash_on: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub hosts: Vec<BackendHost>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u32,
}

fn default_timeout_secs() -> u32 {
    60
}

/// A plugin attached to a stage or a resource
///
/// The configuration is kept as YAML text, exactly as the administrative
/// surface stores it; the plugin registry parses and converts it at release time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginBinding {
    /// Plugin type code, e.g. `bk-header-rewrite`
    pub plugin_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: String,
}

impl PluginBinding {
    pub fn new<T: Into<String>, C: Into<String>>(plugin_type: T, config: C) -> Self {
        let plugin_type = plugin_type.into();
        Self {
            name: plugin_type.clone(),
            plugin_type,
            config: config.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_config_defaults() {
        let config: BackendConfig = serde_yaml::from_str(
            "backend_id: 1\nstage_id: 2\nhosts:\n  - scheme: http\n    host: 10.0.0.1:8080\n",
        )
        .unwrap();
        assert_eq!(config.load_balance, LoadBalance::RoundRobin);
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.hosts[0].weight, 100);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&Status::Inactive).unwrap(), "\"inactive\"");
        assert!(Status::default().is_active());
    }
}
