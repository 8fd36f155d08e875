//! # Plugin Registry
//!
//! Plugin bindings carry their configuration as YAML text written by
//! administrators. Before a release, each binding is validated and converted
//! into the JSON configuration the data plane expects.
//!
//! Handlers form a closed set ([`PluginKind`]); a [`PluginRegistry`] maps type
//! codes to handlers. It is built once at startup and shared by reference.
//! Unknown codes resolve to [`PluginKind::Default`], which passes the
//! configuration through unchanged.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::core::error::{ReleaseError, ReleaseResult};
use crate::domain::PluginBinding;

/// Rate limit periods accepted by the data plane, in seconds
const RATE_LIMIT_PERIODS: [u64; 4] = [1, 60, 3600, 86400];

/// Built-in plugin handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    HeaderRewrite,
    Cors,
    IpRestriction,
    RateLimit,
    Mock,
    /// Passthrough for plugin types without a dedicated handler
    Default,
}

impl PluginKind {
    pub const BUILTIN: [PluginKind; 5] = [
        Self::HeaderRewrite,
        Self::Cors,
        Self::IpRestriction,
        Self::RateLimit,
        Self::Mock,
    ];

    /// Type code this handler is registered under by default
    pub fn code(&self) -> &'static str {
        match self {
            Self::HeaderRewrite => "bk-header-rewrite",
            Self::Cors => "bk-cors",
            Self::IpRestriction => "bk-ip-restriction",
            Self::RateLimit => "bk-rate-limit",
            Self::Mock => "bk-mock",
            Self::Default => "default",
        }
    }

    /// Check a parsed configuration
    pub fn validate(&self, plugin: &str, config: &Value) -> ReleaseResult<()> {
        match self {
            Self::HeaderRewrite => validate_header_rewrite(plugin, config),
            Self::Cors => validate_cors(plugin, config),
            Self::IpRestriction => validate_ip_restriction(plugin, config),
            Self::RateLimit => validate_rate_limit(plugin, config),
            Self::Mock => validate_mock(plugin, config),
            Self::Default => Ok(()),
        }
    }

    /// Convert a validated configuration into its data-plane form
    pub fn convert(&self, config: Value) -> Value {
        match self {
            Self::HeaderRewrite => convert_header_rewrite(config),
            Self::Cors => convert_cors(config),
            Self::IpRestriction => convert_ip_restriction(config),
            Self::Mock => convert_mock(config),
            Self::RateLimit | Self::Default => config,
        }
    }
}

/// Type code → handler lookup
#[derive(Debug, Clone)]
pub struct PluginRegistry {
    handlers: HashMap<String, PluginKind>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Registry with every built-in handler under its default code
    pub fn new() -> Self {
        let handlers = PluginKind::BUILTIN
            .iter()
            .map(|kind| (kind.code().to_string(), *kind))
            .collect();
        Self { handlers }
    }

    /// Register a handler under an additional type code
    pub fn register<S: Into<String>>(&mut self, code: S, kind: PluginKind) {
        self.handlers.insert(code.into(), kind);
    }

    pub fn resolve(&self, code: &str) -> PluginKind {
        self.handlers.get(code).copied().unwrap_or(PluginKind::Default)
    }

    /// Parse YAML configuration text; empty text is an empty object
    pub fn parse(plugin: &str, yaml: &str) -> ReleaseResult<Value> {
        if yaml.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        let value: Value = serde_yaml::from_str(yaml)
            .map_err(|e| ReleaseError::plugin(plugin, format!("invalid yaml: {}", e)))?;
        match value {
            Value::Null => Ok(Value::Object(Map::new())),
            Value::Object(_) => Ok(value),
            _ => Err(ReleaseError::plugin(plugin, "config must be a mapping")),
        }
    }

    pub fn validate(&self, binding: &PluginBinding) -> ReleaseResult<()> {
        let config = Self::parse(&binding.plugin_type, &binding.config)?;
        self.resolve(&binding.plugin_type)
            .validate(&binding.plugin_type, &config)
    }

    /// Validate and convert a binding
    pub fn convert(&self, binding: &PluginBinding) -> ReleaseResult<Value> {
        let config = Self::parse(&binding.plugin_type, &binding.config)?;
        let kind = self.resolve(&binding.plugin_type);
        kind.validate(&binding.plugin_type, &config)?;
        Ok(kind.convert(config))
    }
}

fn key_value_list<'a>(config: &'a Value, field: &str) -> impl Iterator<Item = &'a Value> {
    config
        .get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn validate_header_rewrite(plugin: &str, config: &Value) -> ReleaseResult<()> {
    for item in key_value_list(config, "set").chain(key_value_list(config, "remove")) {
        let key = item.get("key").and_then(Value::as_str).unwrap_or_default();
        if key.trim().is_empty() {
            return Err(ReleaseError::plugin(plugin, "header key must not be empty"));
        }
    }
    Ok(())
}

fn convert_header_rewrite(config: Value) -> Value {
    let set: Map<String, Value> = key_value_list(&config, "set")
        .filter_map(|item| {
            let key = item.get("key")?.as_str()?.to_string();
            let value = item.get("value").cloned().unwrap_or(Value::String(String::new()));
            Some((key, value))
        })
        .collect();
    let remove: Vec<Value> = key_value_list(&config, "remove")
        .filter_map(|item| item.get("key").cloned())
        .collect();
    json!({ "set": set, "remove": remove })
}

fn validate_cors(plugin: &str, config: &Value) -> ReleaseResult<()> {
    let origins = config
        .get("allow_origins")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let by_regex = config
        .get("allow_origins_by_regex")
        .and_then(Value::as_array)
        .map(|items| !items.is_empty())
        .unwrap_or(false);
    if origins.is_empty() && !by_regex {
        return Err(ReleaseError::plugin(
            plugin,
            "one of allow_origins or allow_origins_by_regex is required",
        ));
    }

    let credential = config
        .get("allow_credential")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if credential {
        for field in ["allow_origins", "allow_methods", "allow_headers", "expose_headers"] {
            if config.get(field).and_then(Value::as_str) == Some("*") {
                return Err(ReleaseError::plugin(
                    plugin,
                    format!("{} cannot be '*' when allow_credential is true", field),
                ));
            }
        }
    }
    Ok(())
}

fn convert_cors(config: Value) -> Value {
    let mut converted = match config {
        Value::Object(map) => map
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect::<Map<String, Value>>(),
        _ => Map::new(),
    };
    converted
        .entry("allow_methods")
        .or_insert_with(|| json!("*"));
    converted
        .entry("allow_headers")
        .or_insert_with(|| json!("*"));
    converted.entry("max_age").or_insert_with(|| json!(5));
    converted
        .entry("allow_credential")
        .or_insert_with(|| json!(false));
    Value::Object(converted)
}

/// Entries of an address list: one per line, `#` comments allowed
fn address_entries(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_ip_or_cidr(entry: &str) -> bool {
    match entry.split_once('/') {
        None => entry.parse::<IpAddr>().is_ok(),
        Some((addr, bits)) => match (addr.parse::<IpAddr>(), bits.parse::<u8>()) {
            (Ok(IpAddr::V4(_)), Ok(bits)) => bits <= 32,
            (Ok(IpAddr::V6(_)), Ok(bits)) => bits <= 128,
            _ => false,
        },
    }
}

fn validate_ip_restriction(plugin: &str, config: &Value) -> ReleaseResult<()> {
    let whitelist = config.get("whitelist").and_then(Value::as_str);
    let blacklist = config.get("blacklist").and_then(Value::as_str);
    let text = match (whitelist, blacklist) {
        (Some(list), None) | (None, Some(list)) => list,
        _ => {
            return Err(ReleaseError::plugin(
                plugin,
                "exactly one of whitelist or blacklist is required",
            ))
        }
    };

    let entries = address_entries(text);
    if entries.is_empty() {
        return Err(ReleaseError::plugin(plugin, "address list must not be empty"));
    }
    if let Some(bad) = entries.iter().find(|e| !is_ip_or_cidr(e)) {
        return Err(ReleaseError::plugin(
            plugin,
            format!("{} is not an IP address or CIDR", bad),
        ));
    }
    Ok(())
}

fn convert_ip_restriction(config: Value) -> Value {
    let mut converted = Map::new();
    for field in ["whitelist", "blacklist"] {
        if let Some(text) = config.get(field).and_then(Value::as_str) {
            converted.insert(field.to_string(), json!(address_entries(text)));
        }
    }
    Value::Object(converted)
}

fn validate_rate_limit(plugin: &str, config: &Value) -> ReleaseResult<()> {
    let rates = config
        .get("rates")
        .and_then(Value::as_object)
        .ok_or_else(|| ReleaseError::plugin(plugin, "rates is required"))?;

    for (target, limits) in rates {
        let limits = limits.as_array().ok_or_else(|| {
            ReleaseError::plugin(plugin, format!("rates of {} must be a list", target))
        })?;
        for limit in limits {
            let tokens = limit.get("tokens").and_then(Value::as_u64).unwrap_or(0);
            let period = limit.get("period").and_then(Value::as_u64).unwrap_or(0);
            if tokens == 0 {
                return Err(ReleaseError::plugin(
                    plugin,
                    format!("tokens of {} must be positive", target),
                ));
            }
            if !RATE_LIMIT_PERIODS.contains(&period) {
                return Err(ReleaseError::plugin(
                    plugin,
                    format!("period {} of {} is not supported", period, target),
                ));
            }
        }
    }
    Ok(())
}

fn validate_mock(plugin: &str, config: &Value) -> ReleaseResult<()> {
    match config.get("response_status").map(Value::as_u64) {
        None => Ok(()),
        Some(Some(status)) if (100..600).contains(&status) => Ok(()),
        Some(_) => Err(ReleaseError::plugin(plugin, "response_status must be an HTTP status")),
    }
}

fn convert_mock(config: Value) -> Value {
    let headers: Map<String, Value> = key_value_list(&config, "response_headers")
        .filter_map(|item| {
            let key = item.get("key")?.as_str()?.to_string();
            Some((key, item.get("value").cloned().unwrap_or(Value::Null)))
        })
        .collect();
    json!({
        "response_status": config.get("response_status").cloned().unwrap_or(json!(200)),
        "response_example": config.get("response_example").cloned().unwrap_or(json!("")),
        "response_headers": headers,
    })
}
