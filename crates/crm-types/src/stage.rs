//! Lifecycle stages and the contact snapshot the lifecycle engine reads.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::FieldMap;
use crate::CrmError;

/// A named phase in a contact's relationship progression.
///
/// Variants are declared in progression order; the derived `Ord` is the
/// default progression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Lead,
    Mql,
    Sql,
    Opportunity,
    Customer,
    Advocate,
}

impl LifecycleStage {
    pub const ALL: [LifecycleStage; 6] = [
        LifecycleStage::Lead,
        LifecycleStage::Mql,
        LifecycleStage::Sql,
        LifecycleStage::Opportunity,
        LifecycleStage::Customer,
        LifecycleStage::Advocate,
    ];

    /// 1-based position in the progression.
    pub fn order(&self) -> u32 {
        match self {
            LifecycleStage::Lead => 1,
            LifecycleStage::Mql => 2,
            LifecycleStage::Sql => 3,
            LifecycleStage::Opportunity => 4,
            LifecycleStage::Customer => 5,
            LifecycleStage::Advocate => 6,
        }
    }

    /// The stage that follows in the default progression, `None` for the last.
    pub fn next(&self) -> Option<LifecycleStage> {
        Self::ALL.get(self.order() as usize).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStage::Lead => "lead",
            LifecycleStage::Mql => "mql",
            LifecycleStage::Sql => "sql",
            LifecycleStage::Opportunity => "opportunity",
            LifecycleStage::Customer => "customer",
            LifecycleStage::Advocate => "advocate",
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleStage {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .find(|stage| stage.as_str() == lowered)
            .copied()
            .ok_or_else(|| CrmError::Configuration(format!("unknown lifecycle stage '{s}'")))
    }
}

/// Snapshot of a contact handed to the lifecycle engine by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: String,
    #[serde(default)]
    pub fields: FieldMap,
    pub stage: LifecycleStage,
}

impl ContactRecord {
    pub fn new(id: impl Into<String>, stage: LifecycleStage) -> Self {
        Self {
            id: id.into(),
            fields: FieldMap::new(),
            stage,
        }
    }

    #[must_use]
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        value: impl Into<crate::FieldValue>,
    ) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_totally_ordered() {
        assert!(LifecycleStage::Lead < LifecycleStage::Mql);
        assert!(LifecycleStage::Customer < LifecycleStage::Advocate);
        let mut sorted = LifecycleStage::ALL;
        sorted.sort();
        assert_eq!(sorted, LifecycleStage::ALL);
    }

    #[test]
    fn next_follows_default_progression() {
        assert_eq!(LifecycleStage::Lead.next(), Some(LifecycleStage::Mql));
        assert_eq!(LifecycleStage::Customer.next(), Some(LifecycleStage::Advocate));
        assert_eq!(LifecycleStage::Advocate.next(), None);
    }

    #[test]
    fn order_is_one_based() {
        assert_eq!(LifecycleStage::Lead.order(), 1);
        assert_eq!(LifecycleStage::Advocate.order(), 6);
    }

    #[test]
    fn parse_and_display_round_trip_names() {
        for stage in LifecycleStage::ALL {
            assert_eq!(stage.to_string().parse::<LifecycleStage>().unwrap(), stage);
        }
        assert_eq!("MQL".parse::<LifecycleStage>().unwrap(), LifecycleStage::Mql);
        assert!("prospect".parse::<LifecycleStage>().is_err());
    }

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&LifecycleStage::Opportunity).unwrap(),
            "\"opportunity\""
        );
    }
}
