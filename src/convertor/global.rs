//! Plugin metadata shared by all gateways.

use serde_json::Value;
use std::collections::BTreeMap;

use super::types::PluginMetadata;
use crate::core::error::{ReleaseError, ReleaseResult};

/// Converts configured plugin metadata into data-plane records
pub struct GlobalResourceConvertor<'a> {
    metadata: &'a BTreeMap<String, Value>,
}

impl<'a> GlobalResourceConvertor<'a> {
    pub fn new(metadata: &'a BTreeMap<String, Value>) -> Self {
        Self { metadata }
    }

    /// One record per plugin, ordered by plugin name
    pub fn convert(&self) -> ReleaseResult<Vec<PluginMetadata>> {
        self.metadata
            .iter()
            .map(|(name, config)| {
                if !config.is_object() {
                    return Err(ReleaseError::plugin(name.as_str(), "metadata must be a mapping"));
                }
                Ok(PluginMetadata {
                    id: name.clone(),
                    config: config.clone(),
                })
            })
            .collect()
    }
}
