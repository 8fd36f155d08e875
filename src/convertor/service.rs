//! Backend → service conversion.

use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use url::Url;

use super::plugin::PluginRegistry;
use super::types::{Service, Upstream, UpstreamNode, UpstreamTimeout};
use super::{BackendBinding, ReleaseData};
use crate::core::config::ConvertorConfig;
use crate::core::error::{ReleaseError, ReleaseResult};
use crate::domain::{BackendConfig, LoadBalance, PluginBinding};

/// `{gateway}.{stage}.{stage_id}-{backend_id}`
pub fn service_id(data: &ReleaseData, backend_id: i64) -> String {
    format!("{}.{}-{}", data.id_prefix(), data.stage.id, backend_id)
}

/// Converts the backends used by a release into services
pub struct ServiceConvertor<'a> {
    data: &'a ReleaseData,
    registry: &'a PluginRegistry,
    config: &'a ConvertorConfig,
}

impl<'a> ServiceConvertor<'a> {
    pub fn new(
        data: &'a ReleaseData,
        registry: &'a PluginRegistry,
        config: &'a ConvertorConfig,
    ) -> Self {
        Self {
            data,
            registry,
            config,
        }
    }

    /// One service per backend referenced by a released resource, ordered by backend id
    pub fn convert(&self) -> ReleaseResult<Vec<Service>> {
        let referenced: BTreeSet<i64> = self
            .data
            .active_records()
            .map(|record| record.proxy.backend_id)
            .collect();

        let plugins = self.stage_plugins()?;

        referenced
            .into_iter()
            .map(|backend_id| {
                let binding = self.data.backends.get(&backend_id).ok_or_else(|| {
                    ReleaseError::not_found("backend", backend_id)
                })?;
                self.convert_backend(binding, &plugins)
            })
            .collect()
    }

    fn convert_backend(
        &self,
        binding: &BackendBinding,
        plugins: &BTreeMap<String, Value>,
    ) -> ReleaseResult<Service> {
        let backend = &binding.backend;
        let config = binding
            .config
            .as_ref()
            .filter(|config| !config.hosts.is_empty())
            .ok_or_else(|| ReleaseError::EmptyHosts {
                backend: backend.name.clone(),
            })?;

        Ok(Service {
            id: service_id(self.data, backend.id),
            name: format!("{}-{}", self.data.id_prefix(), backend.name),
            upstream: upstream(&backend.name, config)?,
            plugins: plugins.clone(),
            labels: self.data.labels(),
        })
    }

    /// Plugins shared by every service of the stage
    ///
    /// Later layers win on name collision: defaults, then gateway legacy
    /// plugins, then stage bindings.
    fn stage_plugins(&self) -> ReleaseResult<BTreeMap<String, Value>> {
        let mut plugins = self.default_plugins();

        let legacy = self
            .config
            .legacy_plugins
            .get(&self.data.gateway.name)
            .map(Vec::as_slice)
            .unwrap_or_default();
        self.merge_bindings(&mut plugins, legacy)?;
        self.merge_bindings(&mut plugins, &self.data.stage_plugins)?;

        Ok(plugins)
    }

    fn default_plugins(&self) -> BTreeMap<String, Value> {
        let mut plugins = BTreeMap::new();
        if self.config.telemetry_enabled {
            plugins.insert(
                "bk-opentelemetry".to_string(),
                json!({"sampler": {"name": "always_on"}}),
            );
        }
        if self.config.auth_validate_enabled {
            plugins.insert("bk-auth-validate".to_string(), json!({}));
        }
        if self.config.multi_tenant_mode {
            plugins.insert(
                "bk-tenant-verify".to_string(),
                json!({"tenant_id": self.data.gateway.tenant_id.clone().unwrap_or_default()}),
            );
        }
        if let Some(limit) = &self.config.concurrency_limit {
            plugins.insert(
                "bk-concurrency-limit".to_string(),
                json!({"max_concurrency": limit.max_concurrency}),
            );
        }
        plugins
    }

    fn merge_bindings(
        &self,
        plugins: &mut BTreeMap<String, Value>,
        bindings: &[PluginBinding],
    ) -> ReleaseResult<()> {
        for binding in bindings {
            plugins.insert(binding.plugin_type.clone(), self.registry.convert(binding)?);
        }
        Ok(())
    }
}

fn upstream(backend: &str, config: &BackendConfig) -> ReleaseResult<Upstream> {
    let scheme = config.hosts[0].scheme.to_lowercase();
    if let Some(other) = config
        .hosts
        .iter()
        .find(|host| !host.scheme.eq_ignore_ascii_case(&scheme))
    {
        return Err(ReleaseError::precondition(format!(
            "backend {} mixes {} and {} hosts",
            backend, scheme, other.scheme
        )));
    }

    let nodes = config
        .hosts
        .iter()
        .map(|host| {
            let (address, port) = parse_host(&scheme, &host.host).ok_or_else(|| {
                ReleaseError::precondition(format!(
                    "backend {} has an invalid host {}",
                    backend, host.host
                ))
            })?;
            let weight = match config.load_balance {
                LoadBalance::RoundRobin => 1,
                LoadBalance::WeightedRoundRobin | LoadBalance::Chash => host.weight,
            };
            Ok(UpstreamNode {
                host: address,
                port,
                weight,
                priority: 0,
            })
        })
        .collect::<ReleaseResult<Vec<_>>>()?;

    let (lb_type, hash_on, key) = match config.load_balance {
        LoadBalance::Chash => ("chash", config.hash_on.clone(), config.key.clone()),
        LoadBalance::RoundRobin | LoadBalance::WeightedRoundRobin => ("roundrobin", None, None),
    };

    Ok(Upstream {
        lb_type: lb_type.to_string(),
        scheme,
        nodes,
        timeout: UpstreamTimeout::uniform(config.timeout_secs),
        hash_on,
        key,
    })
}

/// Host and port of a backend host entry, defaulting the port from the scheme
fn parse_host(scheme: &str, host: &str) -> Option<(String, u16)> {
    let url = Url::parse(&format!("{}://{}", scheme, host.trim())).ok()?;
    let address = url.host_str()?.to_string();
    let port = url.port_or_known_default()?;
    Some((address, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convertor::fixtures::{record, release_data};
    use crate::convertor::DataPlaneRecord;
    use crate::core::config::ConcurrencyLimitConfig;
    use crate::domain::{Backend, BackendHost};

    fn convert(data: &ReleaseData, config: &ConvertorConfig) -> ReleaseResult<Vec<Service>> {
        let registry = PluginRegistry::new();
        ServiceConvertor::new(data, &registry, config).convert()
    }

    fn host(scheme: &str, host: &str) -> BackendHost {
        BackendHost {
            scheme: scheme.to_string(),
            host: host.to_string(),
            weight: 10,
        }
    }

    #[test]
    fn test_service_identity_and_upstream() {
        let data = release_data(vec![record(1, "GET", "/a")]);
        let services = convert(&data, &ConvertorConfig::default()).unwrap();

        assert_eq!(services.len(), 1);
        let service = &services[0];
        assert_eq!(service.id, "demo.prod.2-7");
        assert_eq!(service.upstream.lb_type, "roundrobin");
        assert_eq!(service.upstream.scheme, "http");
        assert_eq!(
            service.upstream.nodes,
            vec![UpstreamNode {
                host: "10.0.0.1".to_string(),
                port: 8080,
                weight: 1,
                priority: 0
            }]
        );
        assert_eq!(service.upstream.timeout, UpstreamTimeout::uniform(30));
    }

    #[test]
    fn test_default_ports_follow_scheme() {
        assert_eq!(parse_host("http", "api.example.com"), Some(("api.example.com".to_string(), 80)));
        assert_eq!(parse_host("https", "api.example.com"), Some(("api.example.com".to_string(), 443)));
        assert_eq!(parse_host("https", "api.example.com:8443"), Some(("api.example.com".to_string(), 8443)));
        assert_eq!(parse_host("http", ""), None);
    }

    #[test]
    fn test_only_referenced_backends_are_converted() {
        let mut data = release_data(vec![record(1, "GET", "/a")]);
        data.backends.insert(
            8,
            BackendBinding {
                backend: Backend {
                    id: 8,
                    gateway_id: 1,
                    name: "unused".to_string(),
                },
                config: None,
            },
        );
        let services = convert(&data, &ConvertorConfig::default()).unwrap();
        assert_eq!(services.len(), 1);
    }

    #[test]
    fn test_empty_hosts_are_rejected() {
        let mut data = release_data(vec![record(1, "GET", "/a")]);
        if let Some(binding) = data.backends.get_mut(&7) {
            binding.config = binding.config.take().map(|mut config| {
                config.hosts.clear();
                config
            });
        }
        let err = convert(&data, &ConvertorConfig::default()).unwrap_err();
        assert_eq!(
            err,
            ReleaseError::EmptyHosts {
                backend: "default".to_string()
            }
        );
    }

    #[test]
    fn test_weighted_and_chash_upstreams() {
        let mut data = release_data(vec![record(1, "GET", "/a")]);
        if let Some(config) = data.backends.get_mut(&7).and_then(|b| b.config.as_mut()) {
            config.load_balance = LoadBalance::Chash;
            config.hash_on = Some("header".to_string());
            config.key = Some("X-User".to_string());
            config.hosts = vec![host("https", "a.example.com"), host("https", "b.example.com")];
        }
        let services = convert(&data, &ConvertorConfig::default()).unwrap();
        let upstream = &services[0].upstream;
        assert_eq!(upstream.lb_type, "chash");
        assert_eq!(upstream.hash_on.as_deref(), Some("header"));
        assert!(upstream.nodes.iter().all(|n| n.port == 443 && n.weight == 10));
    }

    #[test]
    fn test_mixed_schemes_are_rejected() {
        let mut data = release_data(vec![record(1, "GET", "/a")]);
        if let Some(config) = data.backends.get_mut(&7).and_then(|b| b.config.as_mut()) {
            config.hosts = vec![host("http", "a.example.com"), host("https", "b.example.com")];
        }
        assert!(convert(&data, &ConvertorConfig::default())
            .unwrap_err()
            .is_precondition());
    }

    #[test]
    fn test_plugin_precedence() {
        let mut data = release_data(vec![record(1, "GET", "/a")]);
        data.stage_plugins = vec![PluginBinding::new(
            "bk-auth-validate",
            "enabled: false",
        )];

        let mut config = ConvertorConfig {
            multi_tenant_mode: true,
            concurrency_limit: Some(ConcurrencyLimitConfig { max_concurrency: 50 }),
            ..Default::default()
        };
        config.legacy_plugins.insert(
            "demo".to_string(),
            vec![
                PluginBinding::new("bk-opentelemetry", "sampler: {name: always_off}"),
                PluginBinding::new("bk-auth-validate", "enabled: legacy"),
            ],
        );

        let services = convert(&data, &config).unwrap();
        let plugins = &services[0].plugins;
        assert_eq!(plugins["bk-opentelemetry"], json!({"sampler": {"name": "always_off"}}));
        assert_eq!(plugins["bk-auth-validate"], json!({"enabled": false}));
        assert_eq!(plugins["bk-tenant-verify"], json!({"tenant_id": "default"}));
        assert_eq!(plugins["bk-concurrency-limit"], json!({"max_concurrency": 50}));
    }

    #[test]
    fn test_conversion_is_idempotent() {
        let data = release_data(vec![record(1, "GET", "/a"), record(2, "POST", "/b")]);
        let config = ConvertorConfig::default();
        let first = convert(&data, &config).unwrap();
        let second = convert(&data, &config).unwrap();
        assert_eq!(
            first[0].to_bytes().unwrap(),
            second[0].to_bytes().unwrap()
        );
    }
}
