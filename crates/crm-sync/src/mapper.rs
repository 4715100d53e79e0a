//! Field mapping between a source and a target system.
//!
//! A [`FieldMapping`] projects source field names onto target field names for
//! one object type. Mapping is a projection: source fields without an entry
//! are dropped, or rejected in strict mode.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crm_types::{CrmError, FieldMap, ObjectType, Record, Result};

/// Source field name → target field name for one object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping {
    fields: BTreeMap<String, String>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapping where every listed field keeps its name.
    pub fn identity<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|f| {
                let f = f.into();
                (f.clone(), f)
            })
            .collect();
        Self { fields }
    }

    #[must_use]
    pub fn with(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.insert(source, target);
        self
    }

    pub fn insert(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.fields.insert(source.into(), target.into());
    }

    pub fn target_for(&self, source: &str) -> Option<&str> {
        self.fields.get(source).map(String::as_str)
    }

    pub fn source_for(&self, target: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(_, t)| t.as_str() == target)
            .map(|(s, _)| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(s, t)| (s.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reject empty names and two source fields feeding the same target.
    pub fn validate(&self, object_type: ObjectType) -> Result<()> {
        if self.fields.is_empty() {
            return Err(CrmError::Configuration(format!(
                "field mapping for {object_type} is empty"
            )));
        }
        let mut targets = BTreeSet::new();
        for (source, target) in &self.fields {
            if source.trim().is_empty() || target.trim().is_empty() {
                return Err(CrmError::Configuration(format!(
                    "field mapping for {object_type} has an empty field name"
                )));
            }
            if !targets.insert(target.as_str()) {
                return Err(CrmError::Configuration(format!(
                    "field mapping for {object_type} maps more than one source field to '{target}'"
                )));
            }
        }
        Ok(())
    }

    /// Project a source record onto target field names.
    ///
    /// With `strict`, a source field that has no mapping entry fails the
    /// record with [`CrmError::UnmappedField`]; otherwise it is skipped.
    pub fn apply(&self, object_type: ObjectType, record: &Record, strict: bool) -> Result<FieldMap> {
        let mut mapped = FieldMap::new();
        for (name, value) in &record.fields {
            match self.fields.get(name) {
                Some(target) => {
                    mapped.insert(target.clone(), value.clone());
                }
                None if strict => {
                    return Err(CrmError::UnmappedField {
                        object_type: object_type.to_string(),
                        field: name.clone(),
                    });
                }
                None => {}
            }
        }
        Ok(mapped)
    }
}

// ---------------------------------------------------------------------------
// MappingSet
// ---------------------------------------------------------------------------

/// One [`FieldMapping`] per object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingSet {
    by_object: BTreeMap<ObjectType, FieldMapping>,
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, object_type: ObjectType, mapping: FieldMapping) -> Self {
        self.insert(object_type, mapping);
        self
    }

    pub fn insert(&mut self, object_type: ObjectType, mapping: FieldMapping) {
        self.by_object.insert(object_type, mapping);
    }

    pub fn get(&self, object_type: ObjectType) -> Option<&FieldMapping> {
        self.by_object.get(&object_type)
    }

    pub fn object_types(&self) -> impl Iterator<Item = ObjectType> + '_ {
        self.by_object.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_object.is_empty()
    }

    /// Every listed object type must have a valid mapping.
    pub fn validate_for(&self, object_types: &[ObjectType]) -> Result<()> {
        for object_type in object_types {
            match self.by_object.get(object_type) {
                Some(mapping) => mapping.validate(*object_type)?,
                None => {
                    return Err(CrmError::Configuration(format!(
                        "no field mapping configured for {object_type}"
                    )))
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FieldMapper
// ---------------------------------------------------------------------------

/// Applies the configured mappings to source records.
#[derive(Debug, Clone)]
pub struct FieldMapper {
    mappings: MappingSet,
}

impl FieldMapper {
    pub fn new(mappings: MappingSet) -> Self {
        Self { mappings }
    }

    pub fn mappings(&self) -> &MappingSet {
        &self.mappings
    }

    /// Map a source record to target field names.
    ///
    /// An object type with no mapping is a configuration error.
    pub fn map(&self, object_type: ObjectType, record: &Record, strict: bool) -> Result<FieldMap> {
        let mapping = self.mappings.get(object_type).ok_or_else(|| {
            CrmError::Configuration(format!("no field mapping configured for {object_type}"))
        })?;
        mapping.apply(object_type, record, strict)
    }
}
