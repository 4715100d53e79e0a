//! Conflict detection and resolution.
//!
//! A conflict is a mapped field whose source value differs from the value the
//! target currently holds for the same record. Resolution is a pure function
//! of the strategy, both values and both last-modified timestamps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crm_types::{CrmError, FieldMap, FieldValue, ObjectType, Result};

// ---------------------------------------------------------------------------
// ConflictStrategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    SourceWins,
    TargetWins,
    NewestWins,
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::SourceWins => "source_wins",
            ConflictStrategy::TargetWins => "target_wins",
            ConflictStrategy::NewestWins => "newest_wins",
            ConflictStrategy::Manual => "manual",
        }
    }

    /// Parse a strategy tag, falling back to `manual` for anything
    /// unsupported so that no value is ever applied on a guess.
    pub fn parse_or_manual(tag: &str) -> Self {
        tag.parse().unwrap_or_else(|e| {
            tracing::warn!(tag, error = %e, "Unsupported conflict strategy, holding conflicts for review");
            ConflictStrategy::Manual
        })
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "source_wins" => Ok(ConflictStrategy::SourceWins),
            "target_wins" => Ok(ConflictStrategy::TargetWins),
            "newest_wins" => Ok(ConflictStrategy::NewestWins),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(CrmError::ConflictResolution(format!(
                "unsupported strategy '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// One mapped field whose values differ between the systems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub source_value: FieldValue,
    pub target_value: FieldValue,
}

/// Compare a mapped source record with the target's current fields.
///
/// Only fields present in `mapped` are compared. An explicit `null` counts as
/// absent, so null against a missing field is not a conflict while a value
/// against a missing field is.
pub fn detect(mapped: &FieldMap, target: &FieldMap) -> Vec<FieldConflict> {
    mapped
        .iter()
        .filter_map(|(field, source_value)| {
            let target_value = target.get(field).cloned().unwrap_or_default();
            if source_value.is_null() && target_value.is_null() {
                return None;
            }
            (*source_value != target_value).then(|| FieldConflict {
                field: field.clone(),
                source_value: source_value.clone(),
                target_value,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Write the source value to the target.
    Source(FieldValue),
    /// Keep the target value; the field is left out of the update.
    Target(FieldValue),
    /// Hold for manual review; the field is left out of the update.
    Unresolved,
}

impl Resolution {
    /// The value the field ends up with, if decided.
    pub fn value(&self) -> Option<&FieldValue> {
        match self {
            Resolution::Source(v) | Resolution::Target(v) => Some(v),
            Resolution::Unresolved => None,
        }
    }

    pub fn writes_target(&self) -> bool {
        matches!(self, Resolution::Source(_))
    }
}

/// Decide one conflict.
///
/// `newest_wins` picks the side with the later timestamp; equal or missing
/// timestamps fall back to the source.
pub fn resolve(
    strategy: ConflictStrategy,
    conflict: &FieldConflict,
    source_modified: Option<DateTime<Utc>>,
    target_modified: Option<DateTime<Utc>>,
) -> Resolution {
    let source = || Resolution::Source(conflict.source_value.clone());
    let target = || Resolution::Target(conflict.target_value.clone());
    match strategy {
        ConflictStrategy::SourceWins => source(),
        ConflictStrategy::TargetWins => target(),
        ConflictStrategy::NewestWins => match (source_modified, target_modified) {
            (Some(s), Some(t)) if t > s => target(),
            _ => source(),
        },
        ConflictStrategy::Manual => Resolution::Unresolved,
    }
}

// ---------------------------------------------------------------------------
// ConflictRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
}

/// A detected conflict and what became of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub object_type: ObjectType,
    /// Cross-system identity (the match field value).
    pub record_key: String,
    /// Id of the record in the target system.
    pub target_id: String,
    pub field: String,
    pub source_value: FieldValue,
    pub target_value: FieldValue,
    /// Strategy configured on the job that found the conflict.
    pub strategy: ConflictStrategy,
    pub status: ConflictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_value: Option<FieldValue>,
    /// Strategy tag the resolution was made under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_with: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: Uuid,
        object_type: ObjectType,
        record_key: impl Into<String>,
        target_id: impl Into<String>,
        conflict: FieldConflict,
        strategy: ConflictStrategy,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Self {
        let resolved_value = resolution.value().cloned();
        let decided = resolved_value.is_some();
        Self {
            id: Uuid::new_v4(),
            job_id,
            object_type,
            record_key: record_key.into(),
            target_id: target_id.into(),
            field: conflict.field,
            source_value: conflict.source_value,
            target_value: conflict.target_value,
            strategy,
            status: if decided {
                ConflictStatus::Resolved
            } else {
                ConflictStatus::Unresolved
            },
            resolved_value,
            resolved_with: decided.then(|| strategy.to_string()),
            created_at: now,
            resolved_at: decided.then_some(now),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }

    /// Identity used to keep one record per (job, object, record, field).
    pub fn key(&self) -> (Uuid, ObjectType, String, String) {
        (
            self.job_id,
            self.object_type,
            self.record_key.clone(),
            self.field.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn conflict(source: &str, target: &str) -> FieldConflict {
        FieldConflict {
            field: "phone".into(),
            source_value: FieldValue::from(source),
            target_value: FieldValue::from(target),
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, hour, 0, 0).unwrap()
    }

    #[test]
    fn detect_reports_differences_and_presence() {
        let mapped: FieldMap = [
            ("email".to_string(), FieldValue::from("a@x.com")),
            ("phone".to_string(), FieldValue::from("555-0100")),
            ("city".to_string(), FieldValue::from("Oslo")),
            ("fax".to_string(), FieldValue::Null),
        ]
        .into();
        let target: FieldMap = [
            ("email".to_string(), FieldValue::from("a@x.com")),
            ("phone".to_string(), FieldValue::from("555-0199")),
            ("notes".to_string(), FieldValue::from("vip")),
        ]
        .into();

        let found = detect(&mapped, &target);
        let fields: Vec<_> = found.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["city", "phone"]);
        assert_eq!(found[0].target_value, FieldValue::Null);
    }

    #[test]
    fn source_and_target_wins() {
        let c = conflict("A", "B");
        assert_eq!(
            resolve(ConflictStrategy::SourceWins, &c, None, None).value(),
            Some(&FieldValue::from("A"))
        );
        let kept = resolve(ConflictStrategy::TargetWins, &c, None, None);
        assert_eq!(kept.value(), Some(&FieldValue::from("B")));
        assert!(!kept.writes_target());
    }

    #[test]
    fn manual_is_never_auto_resolved() {
        let r = resolve(ConflictStrategy::Manual, &conflict("A", "B"), Some(at(9)), None);
        assert_eq!(r, Resolution::Unresolved);
        assert_eq!(r.value(), None);
    }

    #[test]
    fn newest_wins_uses_timestamps_then_falls_back_to_source() {
        let c = conflict("A", "B");
        assert_eq!(
            resolve(ConflictStrategy::NewestWins, &c, Some(at(8)), Some(at(10))),
            Resolution::Target(FieldValue::from("B"))
        );
        assert_eq!(
            resolve(ConflictStrategy::NewestWins, &c, Some(at(11)), Some(at(10))),
            Resolution::Source(FieldValue::from("A"))
        );
        assert_eq!(
            resolve(ConflictStrategy::NewestWins, &c, Some(at(10)), Some(at(10))),
            Resolution::Source(FieldValue::from("A"))
        );
        assert_eq!(
            resolve(ConflictStrategy::NewestWins, &c, None, Some(at(10))),
            Resolution::Source(FieldValue::from("A"))
        );
    }

    #[test]
    fn unsupported_tag_fails_closed() {
        let err = "last_writer".parse::<ConflictStrategy>().unwrap_err();
        assert!(matches!(err, CrmError::ConflictResolution(_)));
        assert_eq!(
            ConflictStrategy::parse_or_manual("last_writer"),
            ConflictStrategy::Manual
        );
        assert_eq!(
            ConflictStrategy::parse_or_manual("TARGET_WINS"),
            ConflictStrategy::TargetWins
        );
    }

    #[test]
    fn record_status_follows_resolution() {
        let job = Uuid::new_v4();
        let auto = ConflictRecord::new(
            job,
            ObjectType::Contact,
            "a@x.com",
            "101",
            conflict("A", "B"),
            ConflictStrategy::SourceWins,
            &Resolution::Source(FieldValue::from("A")),
            at(9),
        );
        assert!(auto.is_resolved());
        assert_eq!(auto.resolved_with.as_deref(), Some("source_wins"));
        assert_eq!(auto.resolved_at, Some(at(9)));

        let held = ConflictRecord::new(
            job,
            ObjectType::Contact,
            "a@x.com",
            "101",
            conflict("A", "B"),
            ConflictStrategy::Manual,
            &Resolution::Unresolved,
            at(9),
        );
        assert_eq!(held.status, ConflictStatus::Unresolved);
        assert!(held.resolved_value.is_none());
        assert!(held.resolved_at.is_none());
    }
}
