//! Stored field mappings per system pair, used when a sync submission does
//! not carry its own.

use std::sync::Arc;

use dashmap::DashMap;

use crm_sync::{FieldMapping, MappingSet};
use crm_types::{CrmError, ObjectType, Result};

#[derive(Clone, Default)]
pub struct MappingRegistry {
    pairs: Arc<DashMap<(String, String), MappingSet>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store the mapping for one object type of a
    /// `source -> target` pair, replacing any previous one.
    pub fn configure(
        &self,
        source: &str,
        target: &str,
        object_type: ObjectType,
        mapping: FieldMapping,
    ) -> Result<()> {
        if source.trim().is_empty() || target.trim().is_empty() {
            return Err(CrmError::Configuration(
                "mapping needs both a source and a target system".into(),
            ));
        }
        mapping.validate(object_type)?;
        tracing::info!(source, target, %object_type, fields = mapping.len(), "Field mapping configured");
        self.pairs
            .entry((source.to_string(), target.to_string()))
            .or_default()
            .insert(object_type, mapping);
        Ok(())
    }

    pub fn get(&self, source: &str, target: &str) -> Option<MappingSet> {
        self.pairs
            .get(&(source.to_string(), target.to_string()))
            .map(|set| set.clone())
    }

    /// Stored mappings for exactly `object_types`, or a configuration error
    /// naming the first type without one.
    pub fn resolve(
        &self,
        source: &str,
        target: &str,
        object_types: &[ObjectType],
    ) -> Result<MappingSet> {
        let stored = self.get(source, target).unwrap_or_default();
        let mut set = MappingSet::new();
        for object_type in object_types {
            let mapping = stored.get(*object_type).cloned().ok_or_else(|| {
                CrmError::Configuration(format!(
                    "no {object_type} mapping configured for {source} -> {target}"
                ))
            })?;
            set.insert(*object_type, mapping);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_picks_requested_types_only() {
        let registry = MappingRegistry::new();
        registry
            .configure(
                "salesforce",
                "hubspot",
                ObjectType::Contact,
                FieldMapping::new().with("Email", "email"),
            )
            .unwrap();
        registry
            .configure(
                "salesforce",
                "hubspot",
                ObjectType::Deal,
                FieldMapping::new().with("Name", "dealname"),
            )
            .unwrap();

        let set = registry
            .resolve("salesforce", "hubspot", &[ObjectType::Deal])
            .unwrap();
        assert!(set.get(ObjectType::Deal).is_some());
        assert!(set.get(ObjectType::Contact).is_none());

        let err = registry
            .resolve("hubspot", "salesforce", &[ObjectType::Contact])
            .unwrap_err();
        assert!(err.to_string().contains("hubspot -> salesforce"));
    }

    #[test]
    fn invalid_mapping_is_not_stored() {
        let registry = MappingRegistry::new();
        let dup = FieldMapping::new().with("a", "x").with("b", "x");
        assert!(registry
            .configure("s", "t", ObjectType::Contact, dup)
            .is_err());
        assert!(registry.get("s", "t").is_none());
    }
}
