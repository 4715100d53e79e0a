//! Sync job model: what to sync, where the job is, and how it ended.
//!
//! A job is `running` until it completes or fails; terminal jobs are
//! immutable. Progress is tracked per object type as a page cursor so a job
//! can resume after a crash or a cancellation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crm_types::{CrmError, ObjectType, Result};

use crate::conflict::ConflictStrategy;
use crate::mapper::MappingSet;

/// Per-record errors kept on the job; older entries are dropped.
pub const ERROR_LOG_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SyncJobSpec
// ---------------------------------------------------------------------------

/// What a job syncs. Fixed at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobSpec {
    pub source: String,
    pub target: String,
    pub object_types: Vec<ObjectType>,
    pub mappings: MappingSet,
    #[serde(default)]
    pub strategy: ConflictStrategy,
    /// Reject source fields that have no mapping entry.
    #[serde(default)]
    pub strict: bool,
    /// Target-side field identifying a record across systems, per object
    /// type. Unlisted types use [`default_match_field`].
    #[serde(default)]
    pub match_fields: BTreeMap<ObjectType, String>,
}

/// Field used to pair source and target records when none is configured.
pub fn default_match_field(object_type: ObjectType) -> &'static str {
    match object_type {
        ObjectType::Contact => "email",
        ObjectType::Deal => "name",
        ObjectType::Account => "domain",
    }
}

impl SyncJobSpec {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        object_types: Vec<ObjectType>,
        mappings: MappingSet,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            object_types,
            mappings,
            strategy: ConflictStrategy::default(),
            strict: false,
            match_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn match_on(mut self, object_type: ObjectType, field: impl Into<String>) -> Self {
        self.match_fields.insert(object_type, field.into());
        self
    }

    pub fn match_field(&self, object_type: ObjectType) -> &str {
        self.match_fields
            .get(&object_type)
            .map(String::as_str)
            .unwrap_or_else(|| default_match_field(object_type))
    }

    /// Checked before a job is created.
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() || self.target.trim().is_empty() {
            return Err(CrmError::Configuration(
                "source and target systems are required".into(),
            ));
        }
        if self.source == self.target {
            return Err(CrmError::Configuration(format!(
                "source and target are both '{}'",
                self.source
            )));
        }
        if self.object_types.is_empty() {
            return Err(CrmError::Configuration(
                "at least one object type is required".into(),
            ));
        }
        for (i, object_type) in self.object_types.iter().enumerate() {
            if self.object_types[..i].contains(object_type) {
                return Err(CrmError::Configuration(format!(
                    "object type {object_type} listed twice"
                )));
            }
        }
        self.mappings.validate_for(&self.object_types)?;
        for object_type in &self.object_types {
            let field = self.match_field(*object_type);
            let mapping = self.mappings.get(*object_type);
            if mapping.and_then(|m| m.source_for(field)).is_none() {
                return Err(CrmError::Configuration(format!(
                    "match field '{field}' for {object_type} is not a mapping target"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SyncJob
// ---------------------------------------------------------------------------

/// Page position for one object type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCursor {
    /// Source offset of the next page to fetch.
    pub offset: usize,
    /// Committed batches.
    pub batches: usize,
    /// The source has no more pages.
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub object_type: ObjectType,
    /// Source record id, or a page marker for fetch failures.
    pub record_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Outcome counters for one record; applied to the job in record order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated { conflicts: usize, unresolved: usize },
    Unchanged { conflicts: usize, unresolved: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub spec: SyncJobSpec,
    pub status: JobStatus,
    pub records_synced: usize,
    pub errors: usize,
    #[serde(default)]
    pub records_created: usize,
    #[serde(default)]
    pub records_updated: usize,
    #[serde(default)]
    pub conflicts_detected: usize,
    #[serde(default)]
    pub conflicts_unresolved: usize,
    /// Errors since the last success; crossing the threshold fails the job.
    #[serde(default)]
    pub consecutive_failures: usize,
    #[serde(default)]
    pub cursors: BTreeMap<ObjectType, ObjectCursor>,
    #[serde(default)]
    pub error_log: Vec<RecordError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn new(spec: SyncJobSpec, now: DateTime<Utc>) -> Self {
        let cursors = spec
            .object_types
            .iter()
            .map(|ot| (*ot, ObjectCursor::default()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            spec,
            status: JobStatus::Running,
            records_synced: 0,
            errors: 0,
            records_created: 0,
            records_updated: 0,
            conflicts_detected: 0,
            conflicts_unresolved: 0,
            consecutive_failures: 0,
            cursors,
            error_log: Vec::new(),
            failure_reason: None,
            started_at: now,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn cursor(&self, object_type: ObjectType) -> ObjectCursor {
        self.cursors.get(&object_type).copied().unwrap_or_default()
    }

    /// Every object type has been read to the end.
    pub fn all_done(&self) -> bool {
        self.spec
            .object_types
            .iter()
            .all(|ot| self.cursor(*ot).done)
    }

    fn ensure_running(&self, to: JobStatus) -> Result<()> {
        if self.is_terminal() {
            return Err(CrmError::InvalidJobTransition {
                job_id: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    pub fn record_success(&mut self, outcome: RecordOutcome) -> Result<()> {
        self.ensure_running(JobStatus::Running)?;
        self.records_synced += 1;
        self.consecutive_failures = 0;
        match outcome {
            RecordOutcome::Created => self.records_created += 1,
            RecordOutcome::Updated {
                conflicts,
                unresolved,
            } => {
                self.records_updated += 1;
                self.conflicts_detected += conflicts;
                self.conflicts_unresolved += unresolved;
            }
            RecordOutcome::Unchanged {
                conflicts,
                unresolved,
            } => {
                self.conflicts_detected += conflicts;
                self.conflicts_unresolved += unresolved;
            }
        }
        Ok(())
    }

    pub fn record_error(
        &mut self,
        object_type: ObjectType,
        record_id: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_running(JobStatus::Running)?;
        self.errors += 1;
        self.consecutive_failures += 1;
        if self.error_log.len() == ERROR_LOG_LIMIT {
            self.error_log.remove(0);
        }
        self.error_log.push(RecordError {
            object_type,
            record_id: record_id.into(),
            message: message.into(),
            at: now,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Move the cursor past a committed page.
    pub fn advance(
        &mut self,
        object_type: ObjectType,
        page_len: usize,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<ObjectCursor> {
        self.ensure_running(JobStatus::Running)?;
        let cursor = self.cursors.entry(object_type).or_default();
        cursor.offset += page_len;
        cursor.batches += 1;
        cursor.done = page_len < batch_size;
        self.updated_at = now;
        Ok(*cursor)
    }

    pub fn mark_exhausted(&mut self, object_type: ObjectType, now: DateTime<Utc>) -> Result<()> {
        self.ensure_running(JobStatus::Running)?;
        self.cursors.entry(object_type).or_default().done = true;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_running(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.ensure_running(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::FieldMapping;

    fn spec() -> SyncJobSpec {
        SyncJobSpec::new(
            "salesforce",
            "hubspot",
            vec![ObjectType::Contact],
            MappingSet::new().with(
                ObjectType::Contact,
                FieldMapping::new().with("Email", "email").with("Phone", "phone"),
            ),
        )
    }

    #[test]
    fn spec_validation() {
        assert!(spec().validate().is_ok());

        let mut same = spec();
        same.target = "salesforce".into();
        assert!(same.validate().is_err());

        let mut dup = spec();
        dup.object_types.push(ObjectType::Contact);
        assert!(dup.validate().unwrap_err().to_string().contains("listed twice"));

        let no_match = spec().match_on(ObjectType::Contact, "contact_key");
        assert!(no_match
            .validate()
            .unwrap_err()
            .to_string()
            .contains("match field 'contact_key'"));

        let mut unmapped = spec();
        unmapped.object_types.push(ObjectType::Deal);
        assert!(unmapped.validate().is_err());
    }

    #[test]
    fn default_match_fields() {
        let s = spec();
        assert_eq!(s.match_field(ObjectType::Contact), "email");
        assert_eq!(s.match_field(ObjectType::Deal), "name");
        assert_eq!(s.match_field(ObjectType::Account), "domain");
        let s = s.match_on(ObjectType::Contact, "phone");
        assert_eq!(s.match_field(ObjectType::Contact), "phone");
    }

    #[test]
    fn counters_and_consecutive_failures() {
        let now = Utc::now();
        let mut job = SyncJob::new(spec(), now);
        job.record_success(RecordOutcome::Created).unwrap();
        job.record_error(ObjectType::Contact, "r2", "boom", now).unwrap();
        job.record_error(ObjectType::Contact, "r3", "boom", now).unwrap();
        assert_eq!(job.consecutive_failures, 2);
        job.record_success(RecordOutcome::Updated {
            conflicts: 2,
            unresolved: 1,
        })
        .unwrap();
        assert_eq!(job.consecutive_failures, 0);
        assert_eq!(job.records_synced, 2);
        assert_eq!(job.errors, 2);
        assert_eq!(job.conflicts_detected, 2);
        assert_eq!(job.conflicts_unresolved, 1);
        assert_eq!(job.error_log.len(), 2);
    }

    #[test]
    fn error_log_is_bounded() {
        let now = Utc::now();
        let mut job = SyncJob::new(spec(), now);
        for i in 0..ERROR_LOG_LIMIT + 5 {
            job.record_error(ObjectType::Contact, format!("r{i}"), "x", now)
                .unwrap();
        }
        assert_eq!(job.errors, ERROR_LOG_LIMIT + 5);
        assert_eq!(job.error_log.len(), ERROR_LOG_LIMIT);
        assert_eq!(job.error_log[0].record_id, "r5");
    }

    #[test]
    fn cursor_advances_and_finishes_on_short_page() {
        let now = Utc::now();
        let mut job = SyncJob::new(spec(), now);
        let c = job.advance(ObjectType::Contact, 10, 10, now).unwrap();
        assert_eq!((c.offset, c.batches, c.done), (10, 1, false));
        let c = job.advance(ObjectType::Contact, 4, 10, now).unwrap();
        assert_eq!((c.offset, c.batches, c.done), (14, 2, true));
        assert!(job.all_done());
    }

    #[test]
    fn terminal_jobs_are_immutable() {
        let now = Utc::now();
        let mut job = SyncJob::new(spec(), now);
        job.complete(now).unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let err = job.fail("late", now).unwrap_err();
        assert!(matches!(err, CrmError::InvalidJobTransition { .. }));
        assert!(job.record_success(RecordOutcome::Created).is_err());
        assert!(job.advance(ObjectType::Contact, 1, 10, now).is_err());
        assert_eq!(job.records_synced, 0);

        let mut failed = SyncJob::new(spec(), now);
        failed.fail("too many errors", now).unwrap();
        assert!(failed.complete(now).is_err());
        assert_eq!(failed.failure_reason.as_deref(), Some("too many errors"));
    }

    #[test]
    fn job_json_round_trip_keeps_cursor() {
        let now = Utc::now();
        let mut job = SyncJob::new(spec(), now);
        job.advance(ObjectType::Contact, 25, 25, now).unwrap();
        let json = serde_json::to_string(&job).unwrap();
        let back: SyncJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cursor(ObjectType::Contact).offset, 25);
        assert_eq!(back, job);
    }
}
