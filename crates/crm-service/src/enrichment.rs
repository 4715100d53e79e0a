//! Folding enrichment results into contact data.

use std::collections::HashMap;

use async_trait::async_trait;

use crm_types::{EnrichmentProvider, EnrichmentResult, FieldMap};

/// Copy provider fields into `fields` where the contact has no value yet.
///
/// Existing values always win; null provider values are ignored. Returns the
/// names of the fields that were filled, in order.
pub fn merge_absent(fields: &mut FieldMap, found: &FieldMap) -> Vec<String> {
    let mut filled = Vec::new();
    for (name, value) in found {
        if value.is_null() {
            continue;
        }
        let absent = fields.get(name).map_or(true, |v| v.is_null());
        if absent {
            fields.insert(name.clone(), value.clone());
            filled.push(name.clone());
        }
    }
    filled
}

/// Provider backed by a fixed lookup table, keyed by email or domain.
#[derive(Debug, Clone, Default)]
pub struct DirectoryEnrichment {
    source: String,
    entries: HashMap<String, FieldMap>,
}

impl DirectoryEnrichment {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_entry(mut self, identifier: impl Into<String>, fields: FieldMap) -> Self {
        self.entries
            .insert(identifier.into().to_lowercase(), fields);
        self
    }
}

#[async_trait]
impl EnrichmentProvider for DirectoryEnrichment {
    async fn enrich(&self, identifier: &str) -> EnrichmentResult {
        match self.entries.get(&identifier.trim().to_lowercase()) {
            Some(fields) => EnrichmentResult::found(&self.source, fields.clone()),
            None => EnrichmentResult::failed(&self.source, format!("no data for '{identifier}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_types::FieldValue;

    #[test]
    fn only_absent_or_null_fields_are_filled() {
        let mut fields = FieldMap::new();
        fields.insert("title".into(), FieldValue::from("CTO"));
        fields.insert("company".into(), FieldValue::Null);

        let mut found = FieldMap::new();
        found.insert("title".into(), FieldValue::from("Engineer"));
        found.insert("company".into(), FieldValue::from("Acme"));
        found.insert("location".into(), FieldValue::from("Oslo"));
        found.insert("twitter".into(), FieldValue::Null);

        let filled = merge_absent(&mut fields, &found);
        assert_eq!(filled, vec!["company", "location"]);
        assert_eq!(fields["title"], FieldValue::from("CTO"));
        assert_eq!(fields["company"], FieldValue::from("Acme"));
        assert!(!fields.contains_key("twitter"));
    }

    #[tokio::test]
    async fn directory_lookup_is_case_insensitive() {
        let mut data = FieldMap::new();
        data.insert("company".into(), FieldValue::from("Acme"));
        let provider = DirectoryEnrichment::new("directory").with_entry("Ada@Acme.io", data);

        let hit = provider.enrich("ada@acme.io").await;
        assert!(hit.success);
        assert_eq!(hit.source, "directory");

        let miss = provider.enrich("bob@acme.io").await;
        assert!(!miss.success);
        assert!(miss.error.unwrap().contains("bob@acme.io"));
    }
}
