//! # Configuration Module
//!
//! This module holds the release pipeline's configuration structures and
//! loading mechanisms.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Human-readable durations (`500ms`, `30s`) through `humantime-serde`
//! - Environment variable override support
//! - Validation with detailed error messages

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::core::error::{ReleaseError, ReleaseResult};
use crate::domain::{PluginBinding, PublishSource, CURRENT_SCHEMA_VERSION};
use crate::observability::config::LogConfig;

/// Main release pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseConfig {
    /// Distributed key-value store the data plane watches
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-(gateway, stage) release lock
    #[serde(default)]
    pub lock: LockConfig,

    /// Domain-to-data-plane conversion settings
    #[serde(default)]
    pub convertor: ConvertorConfig,

    /// Orchestration settings
    #[serde(default)]
    pub release: ReleaseSettings,

    /// Plugin metadata shared by all gateways, published under the global prefix
    #[serde(default)]
    pub global_plugin_metadata: BTreeMap<String, serde_json::Value>,

    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,
}

impl ReleaseConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> ReleaseResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ReleaseError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: ReleaseConfig = serde_yaml::from_str(&content)
            .map_err(|e| ReleaseError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> ReleaseResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ReleaseError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: ReleaseConfig = serde_json::from_str(&content)
            .map_err(|e| ReleaseError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_RELEASE_<SECTION>_<FIELD>
    /// For example: GATEWAY_RELEASE_LOCK_TIMEOUT=30s
    pub fn apply_env_overrides(&mut self) -> ReleaseResult<()> {
        use std::env;

        if let Ok(prefix) = env::var("GATEWAY_RELEASE_STORE_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }

        if let Ok(url) = env::var("GATEWAY_RELEASE_STORE_REDIS_URL") {
            self.store.redis_url = Some(url);
        }

        if let Ok(timeout) = env::var("GATEWAY_RELEASE_STORE_OPERATION_TIMEOUT") {
            self.store.operation_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                ReleaseError::config(format!(
                    "Invalid GATEWAY_RELEASE_STORE_OPERATION_TIMEOUT: {}",
                    e
                ))
            })?;
        }

        if let Ok(timeout) = env::var("GATEWAY_RELEASE_LOCK_TIMEOUT") {
            self.lock.timeout = humantime::parse_duration(&timeout).map_err(|e| {
                ReleaseError::config(format!("Invalid GATEWAY_RELEASE_LOCK_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(retries) = env::var("GATEWAY_RELEASE_LOCK_MAX_RETRIES") {
            self.lock.max_retries = retries.parse().map_err(|e| {
                ReleaseError::config(format!("Invalid GATEWAY_RELEASE_LOCK_MAX_RETRIES: {}", e))
            })?;
        }

        if let Ok(level) = env::var("GATEWAY_RELEASE_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> ReleaseResult<()> {
        for (name, prefix) in [
            ("store.key_prefix", &self.store.key_prefix),
            ("store.global_prefix", &self.store.global_prefix),
        ] {
            if !prefix.starts_with('/') || prefix.len() < 2 {
                return Err(ReleaseError::config(format!(
                    "{} must be an absolute key prefix, got {:?}",
                    name, prefix
                )));
            }
            if prefix.ends_with('/') {
                return Err(ReleaseError::config(format!(
                    "{} must not end with '/', got {:?}",
                    name, prefix
                )));
            }
        }

        let gateway_scope = format!("{}/", self.store.key_prefix);
        let global_scope = format!("{}/", self.store.global_prefix);
        if gateway_scope.starts_with(&global_scope) || global_scope.starts_with(&gateway_scope) {
            return Err(ReleaseError::config(
                "store.key_prefix and store.global_prefix must be disjoint",
            ));
        }

        if self.store.backend == BackendKind::Redis && self.store.redis_url.is_none() {
            return Err(ReleaseError::config(
                "store.redis_url is required for the redis store backend",
            ));
        }

        if self.lock.backend == BackendKind::Redis
            && self.lock.redis_url.is_none()
            && self.store.redis_url.is_none()
        {
            return Err(ReleaseError::config(
                "lock.redis_url (or store.redis_url) is required for the redis lock backend",
            ));
        }

        if self.lock.timeout.is_zero() {
            return Err(ReleaseError::config("lock.timeout must be greater than zero"));
        }

        if self.lock.max_retries == 0 {
            return Err(ReleaseError::config("lock.max_retries must be at least 1"));
        }

        if self.store.operation_timeout.is_zero() {
            return Err(ReleaseError::config(
                "store.operation_timeout must be greater than zero",
            ));
        }

        if self.lock.ttl.is_zero() {
            return Err(ReleaseError::config("lock.ttl must be greater than zero"));
        }

        // distribution is the longest step run under the lease
        if self.lock.ttl <= self.store.operation_timeout {
            return Err(ReleaseError::config(format!(
                "lock.ttl ({:?}) must exceed store.operation_timeout ({:?})",
                self.lock.ttl, self.store.operation_timeout
            )));
        }

        if !self.convertor.api_prefix.starts_with('/') || self.convertor.api_prefix.ends_with('/')
        {
            return Err(ReleaseError::config(format!(
                "convertor.api_prefix must start and not end with '/', got {:?}",
                self.convertor.api_prefix
            )));
        }

        if let Some(limit) = &self.convertor.concurrency_limit {
            if limit.max_concurrency == 0 {
                return Err(ReleaseError::config(
                    "convertor.concurrency_limit.max_concurrency must be greater than zero",
                ));
            }
        }

        if !self.logging.is_valid_level() {
            return Err(ReleaseError::config(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lock: LockConfig::default(),
            convertor: ConvertorConfig::default(),
            release: ReleaseSettings::default(),
            global_plugin_metadata: BTreeMap::new(),
            logging: LogConfig::default(),
        }
    }
}

/// Which implementation backs the store or the lock
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Distributed store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub redis_url: Option<String>,

    /// Root of the per-gateway/per-stage key space
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Root of the key space shared by all gateways
    #[serde(default = "default_global_prefix")]
    pub global_prefix: String,

    /// Deadline for one full reconciliation against the store
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Retries for a single store command (redis backend)
    #[serde(default = "default_store_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
}

fn default_key_prefix() -> String {
    "/bk-gateway-apisix".to_string()
}

fn default_global_prefix() -> String {
    "/bk-gateway-apisix-global".to_string()
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_store_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            redis_url: None,
            key_prefix: default_key_prefix(),
            global_prefix: default_global_prefix(),
            operation_timeout: default_operation_timeout(),
            max_retries: default_store_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

/// Release lock configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub redis_url: Option<String>,

    /// Lock expiry, so a crashed holder cannot block a stage forever
    #[serde(default = "default_lock_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Upper bound on the whole acquisition
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_lock_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    #[serde(default = "default_lock_retries")]
    pub max_retries: u32,
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_lock_retry_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_lock_retries() -> u32 {
    20
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            redis_url: None,
            ttl: default_lock_ttl(),
            timeout: default_lock_timeout(),
            retry_interval: default_lock_retry_interval(),
            max_retries: default_lock_retries(),
        }
    }
}

/// Concurrency limiting applied to every service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyLimitConfig {
    pub max_concurrency: u32,
}

/// Domain-to-data-plane conversion settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvertorConfig {
    /// Path prefix of every published route: `{api_prefix}/{gateway}/{stage}`
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    #[serde(default = "default_true")]
    pub telemetry_enabled: bool,

    #[serde(default = "default_true")]
    pub auth_validate_enabled: bool,

    /// Adds tenant checks to every service
    #[serde(default)]
    pub multi_tenant_mode: bool,

    #[serde(default)]
    pub concurrency_limit: Option<ConcurrencyLimitConfig>,

    /// Gateway name → compatibility plugins kept for gateways migrated from the legacy data plane
    #[serde(default)]
    pub legacy_plugins: HashMap<String, Vec<PluginBinding>>,
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ConvertorConfig {
    fn default() -> Self {
        Self {
            api_prefix: default_api_prefix(),
            telemetry_enabled: true,
            auth_validate_enabled: true,
            multi_tenant_mode: false,
            concurrency_limit: None,
            legacy_plugins: HashMap::new(),
        }
    }
}

/// Orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseSettings {
    /// Sources allowed to publish to inactive gateways/stages
    #[serde(default = "default_bypass_sources")]
    pub bypass_sources: Vec<PublishSource>,

    /// Versions with an older schema must be regenerated before release
    #[serde(default = "default_min_schema_version")]
    pub min_schema_version: u32,
}

fn default_bypass_sources() -> Vec<PublishSource> {
    vec![
        PublishSource::GatewayEnable,
        PublishSource::GatewayDisable,
        PublishSource::StageDisable,
    ]
}

fn default_min_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            bypass_sources: default_bypass_sources(),
            min_schema_version: default_min_schema_version(),
        }
    }
}

impl ReleaseSettings {
    pub fn bypasses_status_checks(&self, source: PublishSource) -> bool {
        self.bypass_sources.contains(&source)
    }
}
