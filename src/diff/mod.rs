//! # Diff Engine
//!
//! Structural comparison of snapshot contents. The engine is pure: it never
//! touches the repository or the store, so it can be used both to decide
//! whether a new resource version is needed and to render release-history
//! change descriptions.
//!
//! ## Key Features
//! - Field-scoped recursive diff of JSON objects: a change inside a nested
//!   object is reported as `{field: nested_diff}` on each side
//! - Missing, `null`, `{}` and `[]` values all count as "empty" and compare equal,
//!   so an unconfigured optional section never shows up as a change
//! - Id-keyed partition of two record collections into add/delete/update
//! - Stage variable context diff

pub mod context;
pub mod records;

pub use context::{diff_contexts, ContextDiff};
pub use records::{
    diff_records, CollectionDiff, DiffKey, FieldDiff, RecordUpdate, ResourceDiff, ResourceDiffer,
};

use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Whether a value counts as "not configured"
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Compare two JSON values
///
/// Returns `None` when they are equivalent, otherwise the minimal differing
/// part of each side. Objects are diffed key by key and recursively; any
/// other value (including arrays) is compared as a whole.
pub fn diff_values(source: &Value, target: &Value) -> Option<(Value, Value)> {
    let source_empty = is_empty_value(source);
    let target_empty = is_empty_value(target);
    if source_empty && target_empty {
        return None;
    }

    match (source, target) {
        (Value::Object(s), Value::Object(t)) => diff_objects(s, t),
        (Value::Object(s), _) if target_empty => diff_objects(s, &Map::new()),
        (_, Value::Object(t)) if source_empty => diff_objects(&Map::new(), t),
        _ if source == target => None,
        _ => Some((source.clone(), target.clone())),
    }
}

fn diff_objects(source: &Map<String, Value>, target: &Map<String, Value>) -> Option<(Value, Value)> {
    let keys: BTreeSet<&String> = source.keys().chain(target.keys()).collect();
    let mut source_diff = Map::new();
    let mut target_diff = Map::new();

    for key in keys {
        let s = source.get(key).unwrap_or(&Value::Null);
        let t = target.get(key).unwrap_or(&Value::Null);
        if let Some((ds, dt)) = diff_values(s, t) {
            source_diff.insert(key.clone(), ds);
            target_diff.insert(key.clone(), dt);
        }
    }

    if source_diff.is_empty() && target_diff.is_empty() {
        None
    } else {
        Some((Value::Object(source_diff), Value::Object(target_diff)))
    }
}

/// Flatten a diff object into dotted field paths (`proxy.path`, `name`)
pub fn changed_fields(diff: &Map<String, Value>) -> Vec<String> {
    let mut fields = Vec::new();
    collect_fields("", diff, &mut fields);
    fields
}

fn collect_fields(prefix: &str, map: &Map<String, Value>, out: &mut Vec<String>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(nested) if !nested.is_empty() => collect_fields(&path, nested, out),
            _ => out.push(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_values_have_no_diff() {
        let value = json!({"name": "a", "proxy": {"path": "/x", "timeout": 30}});
        assert!(diff_values(&value, &value.clone()).is_none());
    }

    #[test]
    fn test_scalar_field_diff_only_contains_changed_keys() {
        let source = json!({"name": "a", "method": "GET"});
        let target = json!({"name": "b", "method": "GET"});
        let (s, t) = diff_values(&source, &target).unwrap();
        assert_eq!(s, json!({"name": "a"}));
        assert_eq!(t, json!({"name": "b"}));
    }

    #[test]
    fn test_nested_diff_is_field_scoped() {
        let source = json!({"proxy": {"path": "/a", "method": "GET", "backend_id": 1}});
        let target = json!({"proxy": {"path": "/b", "method": "GET", "backend_id": 1}});
        let (s, t) = diff_values(&source, &target).unwrap();
        assert_eq!(s, json!({"proxy": {"path": "/a"}}));
        assert_eq!(t, json!({"proxy": {"path": "/b"}}));
    }

    #[test]
    fn test_empty_sections_compare_equal() {
        let source = json!({"plugins": [], "auth": {}, "name": "a"});
        let target = json!({"plugins": null, "name": "a"});
        assert!(diff_values(&source, &target).is_none());
    }

    #[test]
    fn test_section_added_from_empty() {
        let source = json!({"contexts": null});
        let target = json!({"contexts": {"verified_app_required": true}});
        let (s, t) = diff_values(&source, &target).unwrap();
        assert_eq!(s, json!({"contexts": {"verified_app_required": null}}));
        assert_eq!(t, json!({"contexts": {"verified_app_required": true}}));
    }

    #[test]
    fn test_arrays_compare_as_a_whole() {
        let source = json!({"disabled_stages": ["test"]});
        let target = json!({"disabled_stages": ["test", "prod"]});
        let (s, t) = diff_values(&source, &target).unwrap();
        assert_eq!(s, json!({"disabled_stages": ["test"]}));
        assert_eq!(t, json!({"disabled_stages": ["test", "prod"]}));
    }

    #[test]
    fn test_changed_fields_are_dotted() {
        let (s, _) = diff_values(
            &json!({"name": "a", "proxy": {"path": "/a", "timeout": 1}}),
            &json!({"name": "b", "proxy": {"path": "/b", "timeout": 1}}),
        )
        .unwrap();
        let fields = changed_fields(s.as_object().unwrap());
        assert_eq!(fields, vec!["name".to_string(), "proxy.path".to_string()]);
    }
}
