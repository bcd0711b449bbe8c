//! Cross-system identity links.
//!
//! An `EntityMapping` ties one canonical name (a user-chosen identifier for a
//! real-world entity) to each external system's local identifier for it.
//! Pipelines read mappings through the `resolve_mapping` step; sessions
//! manage them through the mapping tools.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::{FlowgateError, Result, ShareLock};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EntityMapping {
    pub canonical_name: String,
    pub entity_type: String,
    /// system alias -> system-local identifier
    pub ids: HashMap<String, String>,
}

impl EntityMapping {
    pub fn system_id(
        &self,
        system: &str,
    ) -> Option<&str> {
        self.ids.get(system).map(|s| s.as_str())
    }
}

/// In-memory mapping registry, keyed by (entity type, canonical name).
#[derive(Clone)]
pub struct MappingStore {
    entries: ShareLock<HashMap<(String, String), EntityMapping>>,
}

impl Default for MappingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert or merge a mapping. Existing per-system ids not present in the
    /// update are kept.
    pub fn upsert(
        &self,
        mapping: EntityMapping,
    ) {
        let key = (mapping.entity_type.clone(), mapping.canonical_name.clone());
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(&key) {
            Some(existing) => existing.ids.extend(mapping.ids),
            None => {
                entries.insert(key, mapping);
            }
        }
    }

    pub fn get(
        &self,
        entity_type: &str,
        canonical_name: &str,
    ) -> Result<EntityMapping> {
        self.entries
            .read()
            .unwrap()
            .get(&(entity_type.to_string(), canonical_name.to_string()))
            .cloned()
            .ok_or_else(|| FlowgateError::NotFound(format!("no {} mapping for '{}'", entity_type, canonical_name)))
    }

    /// List mappings, optionally restricted to one entity type.
    pub fn list(
        &self,
        entity_type: Option<&str>,
    ) -> Vec<EntityMapping> {
        let entries = self.entries.read().unwrap();
        let mut result: Vec<EntityMapping> = entries
            .values()
            .filter(|m| entity_type.map(|t| m.entity_type == t).unwrap_or(true))
            .cloned()
            .collect();
        result.sort_by(|a, b| (&a.entity_type, &a.canonical_name).cmp(&(&b.entity_type, &b.canonical_name)));
        result
    }

    pub fn remove(
        &self,
        entity_type: &str,
        canonical_name: &str,
    ) -> bool {
        self.entries.write().unwrap().remove(&(entity_type.to_string(), canonical_name.to_string())).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(
        entity_type: &str,
        name: &str,
        ids: &[(&str, &str)],
    ) -> EntityMapping {
        EntityMapping {
            canonical_name: name.to_string(),
            entity_type: entity_type.to_string(),
            ids: ids.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let store = MappingStore::new();
        store.upsert(mapping("project", "harbor-north", &[("tracker", "PRJ-7")]));

        let found = store.get("project", "harbor-north").unwrap();
        assert_eq!(found.system_id("tracker"), Some("PRJ-7"));
        assert!(store.get("project", "other").is_err());
    }

    #[test]
    fn test_upsert_merges_system_ids() {
        let store = MappingStore::new();
        store.upsert(mapping("project", "harbor-north", &[("tracker", "PRJ-7")]));
        store.upsert(mapping("project", "harbor-north", &[("crm", "0015x")]));

        let found = store.get("project", "harbor-north").unwrap();
        assert_eq!(found.system_id("tracker"), Some("PRJ-7"));
        assert_eq!(found.system_id("crm"), Some("0015x"));
    }

    #[test]
    fn test_list_by_type() {
        let store = MappingStore::new();
        store.upsert(mapping("project", "a", &[]));
        store.upsert(mapping("customer", "b", &[]));

        assert_eq!(store.list(Some("project")).len(), 1);
        assert_eq!(store.list(None).len(), 2);
    }
}
