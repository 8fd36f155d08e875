//! Resource → route conversion.

use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::plugin::PluginRegistry;
use super::service::service_id;
use super::types::{Route, UpstreamTimeout};
use super::uri::{build_uris, render_path, route_priority, ParamStyle, SUBPATH_PARAM_NAME};
use super::ReleaseData;
use crate::core::config::ConvertorConfig;
use crate::core::error::{ReleaseError, ReleaseResult};
use crate::domain::{PublishId, ResourceRecord};

/// Resource id of the version probe route
pub const VERSION_PROBE_ID: i64 = -1;

/// Path of the version probe route, relative to the stage prefix
pub const VERSION_PROBE_PATH: &str = "/__apigw_version";

const CONTEXT_PLUGIN: &str = "bk-resource-context";
const REWRITE_PLUGIN: &str = "bk-proxy-rewrite";
const MOCK_PLUGIN: &str = "bk-mock";

/// Converts the resources of a release into routes
pub struct RouteConvertor<'a> {
    data: &'a ReleaseData,
    registry: &'a PluginRegistry,
    config: &'a ConvertorConfig,
    publish_id: Option<PublishId>,
    revoke: bool,
}

impl<'a> RouteConvertor<'a> {
    pub fn new(
        data: &'a ReleaseData,
        registry: &'a PluginRegistry,
        config: &'a ConvertorConfig,
        publish_id: Option<PublishId>,
        revoke: bool,
    ) -> Self {
        Self {
            data,
            registry,
            config,
            publish_id,
            revoke,
        }
    }

    /// Routes of the release, ordered by resource id, version probe last
    ///
    /// Fails on the first resource that cannot be converted; no partial
    /// route set is returned.
    pub fn convert(&self) -> ReleaseResult<Vec<Route>> {
        if self.revoke {
            return Ok(Vec::new());
        }

        let mut routes = self
            .data
            .active_records()
            .map(|record| self.convert_record(record))
            .collect::<ReleaseResult<Vec<_>>>()?;

        if let Some(publish_id) = self.publish_id {
            routes.push(self.version_probe(publish_id)?);
        }

        Ok(routes)
    }

    fn stage_prefix(&self) -> String {
        format!(
            "{}/{}/{}",
            self.config.api_prefix, self.data.gateway.name, self.data.stage.name
        )
    }

    fn route_id(&self, resource_id: i64) -> String {
        format!("{}.{}", self.data.id_prefix(), resource_id)
    }

    fn convert_record(&self, record: &ResourceRecord) -> ReleaseResult<Route> {
        let backend_id = record.proxy.backend_id;
        if backend_id == 0 || !self.data.backends.contains_key(&backend_id) {
            return Err(ReleaseError::MissingBackend {
                resource_id: record.id,
                resource_name: record.name.clone(),
            });
        }

        let path = render_path(&record.path, &self.data.stage.vars, ParamStyle::Colon)?;
        let uris = build_uris(&self.stage_prefix(), &path, record.match_subpath);
        let priority = route_priority(&path, record.match_subpath);

        let methods = match record.method.as_str() {
            "ANY" | "" => Vec::new(),
            method => vec![method.to_string()],
        };

        let mut plugins = BTreeMap::new();
        plugins.insert(CONTEXT_PLUGIN.to_string(), resource_context(record));
        plugins.insert(REWRITE_PLUGIN.to_string(), self.proxy_rewrite(record)?);
        for binding in &record.plugins {
            plugins.insert(binding.plugin_type.clone(), self.registry.convert(binding)?);
        }

        Ok(Route {
            id: self.route_id(record.id),
            name: record.name.clone(),
            uris,
            methods,
            priority,
            service_id: Some(service_id(self.data, backend_id)),
            enable_websocket: record.enable_websocket,
            timeout: record.proxy.timeout_secs.map(UpstreamTimeout::uniform),
            plugins,
            labels: self.data.labels(),
        })
    }

    fn proxy_rewrite(&self, record: &ResourceRecord) -> ReleaseResult<Value> {
        let upstream = render_path(&record.proxy.path, &self.data.stage.vars, ParamStyle::Braces)?;

        let uri = if record.match_subpath {
            format!("{}/{{{}}}", upstream.trimmed(), SUBPATH_PARAM_NAME)
        } else {
            upstream.path
        };

        let mut rewrite = json!({
            "uri": uri,
            "match_subpath": record.match_subpath,
        });
        match record.proxy.method.as_str() {
            "" | "ANY" => {}
            method => rewrite["method"] = json!(method),
        }
        Ok(rewrite)
    }

    /// Mock route reporting which publish is live
    fn version_probe(&self, publish_id: PublishId) -> ReleaseResult<Route> {
        let (version_id, version) = self
            .data
            .resource_version
            .as_ref()
            .map(|v| (v.id, v.version.clone()))
            .unwrap_or_default();

        let body = json!({
            "publish_id": publish_id.0,
            "resource_version_id": version_id,
            "version": version,
        });

        let mut plugins = BTreeMap::new();
        plugins.insert(
            MOCK_PLUGIN.to_string(),
            json!({
                "response_status": 200,
                "response_example": serde_json::to_string(&body)?,
                "response_headers": {"Content-Type": "application/json"},
            }),
        );

        Ok(Route {
            id: self.route_id(VERSION_PROBE_ID),
            name: format!("{}-version", self.data.id_prefix()),
            uris: vec![format!("{}{}", self.stage_prefix(), VERSION_PROBE_PATH)],
            methods: vec!["GET".to_string()],
            priority: 0,
            service_id: None,
            enable_websocket: false,
            timeout: None,
            plugins,
            labels: self.data.labels(),
        })
    }
}

fn resource_context(record: &ResourceRecord) -> Value {
    json!({
        "bk_resource_id": record.id,
        "bk_resource_name": record.name,
        "bk_resource_auth": {
            "verified_app_required": record.auth.verified_app_required,
            "verified_user_required": record.auth.verified_user_required,
            "resource_perm_required": record.auth.resource_perm_required,
            "skip_auth_verification": record.auth.skip_auth_verification,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convertor::fixtures::{record, release_data};
    use crate::convertor::uri::SUBPATH_PRIORITY_PENALTY;
    use crate::convertor::DataPlaneRecord;
    use crate::domain::PluginBinding;

    fn convert(data: &ReleaseData, publish_id: Option<PublishId>, revoke: bool) -> ReleaseResult<Vec<Route>> {
        let registry = PluginRegistry::new();
        let config = ConvertorConfig::default();
        RouteConvertor::new(data, &registry, &config, publish_id, revoke).convert()
    }

    #[test]
    fn test_basic_route() {
        let data = release_data(vec![record(3, "GET", "/users/{id}")]);
        let routes = convert(&data, None, false).unwrap();

        assert_eq!(routes.len(), 1);
        let route = &routes[0];
        assert_eq!(route.id, "demo.prod.3");
        assert_eq!(route.uris, vec!["/api/demo/prod/users/:id/?"]);
        assert_eq!(route.methods, vec!["GET"]);
        assert_eq!(route.priority, 0);
        assert_eq!(route.service_id.as_deref(), Some("demo.prod.2-7"));
        assert_eq!(route.plugins[CONTEXT_PLUGIN]["bk_resource_id"], json!(3));
        assert_eq!(
            route.plugins[CONTEXT_PLUGIN]["bk_resource_auth"]["verified_app_required"],
            json!(true)
        );
        assert_eq!(route.plugins[REWRITE_PLUGIN]["uri"], json!("/users/{id}"));
    }

    #[test]
    fn test_any_method_is_unrestricted() {
        let data = release_data(vec![record(1, "ANY", "/echo")]);
        let routes = convert(&data, None, false).unwrap();
        assert!(routes[0].methods.is_empty());
        assert!(routes[0].plugins[REWRITE_PLUGIN].get("method").is_none());
    }

    #[test]
    fn test_stage_variables_are_substituted() {
        let mut rec = record(1, "GET", "/{env.prefix}/users");
        rec.proxy.path = "/backend/{env.prefix}/users".to_string();
        let data = release_data(vec![rec]);
        let routes = convert(&data, None, false).unwrap();
        assert_eq!(routes[0].uris, vec!["/api/demo/prod/v2/users", "/api/demo/prod/v2/users/"]);
        assert_eq!(routes[0].plugins[REWRITE_PLUGIN]["uri"], json!("/backend/v2/users"));
    }

    #[test]
    fn test_subpath_route_priority_below_penalty_plus_literals() {
        let mut rec = record(1, "GET", "api/v1/users/:id");
        rec.match_subpath = true;
        let data = release_data(vec![rec]);
        let routes = convert(&data, None, false).unwrap();

        let route = &routes[0];
        assert_eq!(route.priority, SUBPATH_PRIORITY_PENALTY + 14);
        assert!(route.priority < SUBPATH_PRIORITY_PENALTY + 20);
        assert_eq!(
            route.uris.last().map(String::as_str),
            Some("/api/demo/prod/api/v1/users/:id/*bk_api_subpath_match_param_name")
        );
        assert_eq!(
            route.plugins[REWRITE_PLUGIN]["uri"],
            json!("/api/v1/users/:id/{bk_api_subpath_match_param_name}")
        );
    }

    #[test]
    fn test_version_route_reports_publish_and_version_ids() {
        let data = release_data(vec![record(1, "GET", "/a"), record(2, "POST", "/b")]);
        let routes = convert(&data, Some(PublishId(123)), false).unwrap();

        let probes: Vec<&Route> = routes.iter().filter(|r| r.id.ends_with(".-1")).collect();
        assert_eq!(probes.len(), 1);
        let probe = probes[0];
        assert_eq!(probe.id, "demo.prod.-1");
        assert_eq!(probe.uris, vec!["/api/demo/prod/__apigw_version"]);
        assert_eq!(probe.methods, vec!["GET"]);

        let example = probe.plugins[MOCK_PLUGIN]["response_example"].as_str().unwrap();
        let body: Value = serde_json::from_str(example).unwrap();
        assert_eq!(body["publish_id"], json!(123));
        assert_eq!(body["resource_version_id"], json!(11));
    }

    #[test]
    fn test_revoked_stage_converts_to_no_routes() {
        let data = release_data(vec![record(1, "GET", "/a"), record(2, "POST", "/b")]);
        assert!(convert(&data, Some(PublishId(5)), true).unwrap().is_empty());
        assert!(convert(&data, None, true).unwrap().is_empty());
    }

    #[test]
    fn test_missing_backend_fails_conversion() {
        let mut rec = record(4, "GET", "/a");
        rec.proxy.backend_id = 0;
        let data = release_data(vec![record(1, "GET", "/ok"), rec]);

        let err = convert(&data, Some(PublishId(1)), false).unwrap_err();
        assert_eq!(
            err,
            ReleaseError::MissingBackend {
                resource_id: 4,
                resource_name: "resource_4".to_string()
            }
        );
    }

    #[test]
    fn test_resource_plugins_are_converted() {
        let mut rec = record(1, "GET", "/a");
        rec.plugins = vec![PluginBinding::new(
            "bk-ip-restriction",
            "blacklist: |\n  10.0.0.1\n",
        )];
        let data = release_data(vec![rec]);
        let routes = convert(&data, None, false).unwrap();
        assert_eq!(
            routes[0].plugins["bk-ip-restriction"],
            json!({"blacklist": ["10.0.0.1"]})
        );

        let mut bad = record(2, "GET", "/b");
        bad.plugins = vec![PluginBinding::new("bk-rate-limit", "rates: {a: [{tokens: 0, period: 1}]}")];
        assert!(convert(&release_data(vec![bad]), None, false).is_err());
    }

    #[test]
    fn test_conversion_is_idempotent() {
        let mut rec = record(1, "GET", "/users/{id}");
        rec.match_subpath = true;
        rec.plugins = vec![PluginBinding::new("bk-cors", "allow_origins: 'https://a.example.com'")];
        let data = release_data(vec![rec, record(2, "ANY", "/b")]);

        let first = convert(&data, Some(PublishId(9)), false).unwrap();
        let second = convert(&data, Some(PublishId(9)), false).unwrap();
        let bytes = |routes: &[Route]| {
            routes
                .iter()
                .map(|r| r.to_bytes().unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(bytes(&first), bytes(&second));
    }
}
