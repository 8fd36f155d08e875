//! Id-keyed diff of two record collections.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{changed_fields, diff_values};
use crate::core::error::ReleaseResult;
use crate::domain::ResourceRecord;

/// A record with a stable identity across snapshots
pub trait DiffKey {
    fn diff_key(&self) -> i64;

    /// Short human-readable label used in change summaries
    fn label(&self) -> String {
        format!("#{}", self.diff_key())
    }
}

impl DiffKey for ResourceRecord {
    fn diff_key(&self) -> i64 {
        self.id
    }

    fn label(&self) -> String {
        format!("{} {} ({})", self.method, self.path, self.name)
    }
}

/// Differing fields on each side of an update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FieldDiff {
    pub source: Map<String, Value>,
    pub target: Map<String, Value>,
}

/// A record present on both sides with at least one differing field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordUpdate<T> {
    pub source: T,
    pub target: T,
    pub diff: FieldDiff,
}

/// Add/delete/update partition of two collections, each ordered by key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionDiff<T> {
    pub add: Vec<T>,
    pub delete: Vec<T>,
    pub update: Vec<RecordUpdate<T>>,
}

pub type ResourceDiff = CollectionDiff<ResourceRecord>;

impl<T> Default for CollectionDiff<T> {
    fn default() -> Self {
        Self {
            add: Vec::new(),
            delete: Vec::new(),
            update: Vec::new(),
        }
    }
}

impl<T: DiffKey> CollectionDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.delete.is_empty() && self.update.is_empty()
    }

    /// Number of records touched by this diff
    pub fn len(&self) -> usize {
        self.add.len() + self.delete.len() + self.update.len()
    }

    /// Render one line per change: `+ added`, `- deleted`, `~ updated: fields`
    pub fn summary(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.len());
        lines.extend(self.add.iter().map(|r| format!("+ {}", r.label())));
        lines.extend(self.delete.iter().map(|r| format!("- {}", r.label())));
        lines.extend(self.update.iter().map(|u| {
            format!(
                "~ {}: {}",
                u.target.label(),
                changed_fields(&u.diff.target).join(", ")
            )
        }));
        lines
    }
}

/// Diffs resource snapshots
pub struct ResourceDiffer;

impl ResourceDiffer {
    pub fn diff(source: &[ResourceRecord], target: &[ResourceRecord]) -> ReleaseResult<ResourceDiff> {
        diff_records(source, target)
    }
}

/// Partition `source` and `target` by key and compare shared records field by field
///
/// If a collection holds the same key twice, the later record wins.
pub fn diff_records<T>(source: &[T], target: &[T]) -> ReleaseResult<CollectionDiff<T>>
where
    T: DiffKey + Serialize + Clone,
{
    let source_by_key: BTreeMap<i64, &T> = source.iter().map(|r| (r.diff_key(), r)).collect();
    let target_by_key: BTreeMap<i64, &T> = target.iter().map(|r| (r.diff_key(), r)).collect();

    let mut result = CollectionDiff::default();

    for (key, source_record) in &source_by_key {
        match target_by_key.get(key) {
            None => result.delete.push((*source_record).clone()),
            Some(target_record) => {
                let source_value = serde_json::to_value(source_record)?;
                let target_value = serde_json::to_value(target_record)?;
                if let Some((s, t)) = diff_values(&source_value, &target_value) {
                    result.update.push(RecordUpdate {
                        source: (*source_record).clone(),
                        target: (*target_record).clone(),
                        diff: FieldDiff {
                            source: into_map(s),
                            target: into_map(t),
                        },
                    });
                }
            }
        }
    }

    for (key, target_record) in &target_by_key {
        if !source_by_key.contains_key(key) {
            result.add.push((*target_record).clone());
        }
    }

    Ok(result)
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
