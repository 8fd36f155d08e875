//! Stage variable context diff.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Changes between two stage variable contexts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContextDiff {
    pub add: BTreeMap<String, String>,
    pub delete: BTreeMap<String, String>,
    /// name → (source value, target value)
    pub update: BTreeMap<String, (String, String)>,
}

impl ContextDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.delete.is_empty() && self.update.is_empty()
    }
}

pub fn diff_contexts(
    source: &BTreeMap<String, String>,
    target: &BTreeMap<String, String>,
) -> ContextDiff {
    let mut diff = ContextDiff::default();

    for (name, source_value) in source {
        match target.get(name) {
            None => {
                diff.delete.insert(name.clone(), source_value.clone());
            }
            Some(target_value) if target_value != source_value => {
                diff.update
                    .insert(name.clone(), (source_value.clone(), target_value.clone()));
            }
            Some(_) => {}
        }
    }

    for (name, target_value) in target {
        if !source.contains_key(name) {
            diff.add.insert(name.clone(), target_value.clone());
        }
    }

    diff
}
