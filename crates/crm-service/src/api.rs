//! Request and response shapes for the service operations. Framework
//! agnostic: a REST layer can (de)serialize these directly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crm_lifecycle::{
    parse_conditions, Action, ActionResult, Condition, FunnelStep, StageConfig, StageTransition,
};
use crm_sync::{ConflictRecord, ConflictStrategy, FieldMapping, JobStatus, ObjectCursor, SyncJob};
use crm_types::{ContactRecord, EnrichmentResult, FieldValue, LifecycleStage, ObjectType, Result};

// ---------------------------------------------------------------------------
// Sync jobs
// ---------------------------------------------------------------------------

/// Submit a sync job. `field_mapping` is keyed by object name; object types
/// without an entry fall back to the stored mapping for the system pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitSyncJob {
    pub source: String,
    pub target: String,
    pub objects: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_mapping: BTreeMap<String, FieldMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<String>,
    #[serde(default)]
    pub strict: bool,
    /// Per object name, the target field that identifies a record.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_fields: BTreeMap<String, String>,
}

impl SubmitSyncJob {
    pub fn new<I, S>(source: impl Into<String>, target: impl Into<String>, objects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: source.into(),
            target: target.into(),
            objects: objects.into_iter().map(Into::into).collect(),
            field_mapping: BTreeMap::new(),
            conflict_resolution: None,
            strict: false,
            match_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn mapping(mut self, object: impl Into<String>, mapping: FieldMapping) -> Self {
        self.field_mapping.insert(object.into(), mapping);
        self
    }

    #[must_use]
    pub fn strategy(mut self, tag: impl Into<String>) -> Self {
        self.conflict_resolution = Some(tag.into());
        self
    }

    #[must_use]
    pub fn match_on(mut self, object: impl Into<String>, field: impl Into<String>) -> Self {
        self.match_fields.insert(object.into(), field.into());
        self
    }
}

/// Externally visible state of a sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub sync_id: Uuid,
    pub source: String,
    pub target: String,
    pub objects: Vec<ObjectType>,
    pub status: JobStatus,
    pub conflict_resolution: ConflictStrategy,
    pub records_synced: usize,
    pub errors: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub conflicts_detected: usize,
    pub conflicts_unresolved: usize,
    pub cursors: BTreeMap<ObjectType, ObjectCursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// A run is in progress for this job right now.
    pub active: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobDescriptor {
    pub fn from_job(job: &SyncJob, active: bool) -> Self {
        Self {
            sync_id: job.id,
            source: job.spec.source.clone(),
            target: job.spec.target.clone(),
            objects: job.spec.object_types.clone(),
            status: job.status,
            conflict_resolution: job.spec.strategy,
            records_synced: job.records_synced,
            errors: job.errors,
            records_created: job.records_created,
            records_updated: job.records_updated,
            conflicts_detected: job.conflicts_detected,
            conflicts_unresolved: job.conflicts_unresolved,
            cursors: job.cursors.clone(),
            failure_reason: job.failure_reason.clone(),
            active,
            started_at: job.started_at,
            completed_at: job.finished_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Mappings and conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureMapping {
    pub source: String,
    pub target: String,
    pub object_type: String,
    pub mapping: FieldMapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfigured {
    pub source: String,
    pub target: String,
    pub object_type: ObjectType,
    pub mapping: FieldMapping,
    pub configured_at: DateTime<Utc>,
}

/// Manual resolution: the value to keep and the strategy tag it is filed
/// under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveConflict {
    pub value: FieldValue,
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolved {
    pub conflict: ConflictRecord,
    /// The value was written to the target system.
    pub pushed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Stage definition as submitted by an operator. Conditions may come as a
/// list, as a rule string, or both (the rule's conditions are appended).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: LifecycleStage,
    /// Defaults to the next stage in progression order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<LifecycleStage>,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl StageDefinition {
    pub fn into_config(self) -> Result<StageConfig> {
        let mut conditions = self.conditions;
        if let Some(rule) = &self.rule {
            conditions.extend(parse_conditions(rule)?);
        }
        let next_stage = if self.terminal {
            None
        } else {
            self.next_stage.or_else(|| self.name.next())
        };
        let config = StageConfig {
            stage: self.name,
            next_stage,
            conditions,
            actions: self.actions,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: LifecycleStage,
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<LifecycleStage>,
    pub configured: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Logged transitions into this stage.
    pub entered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationResult {
    Progressed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvaluation {
    pub contact_id: String,
    pub current_stage: LifecycleStage,
    pub evaluation_result: EvaluationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<StageTransition>,
    #[serde(default)]
    pub actions: Vec<ActionResult>,
}

impl LifecycleEvaluation {
    pub fn new_stage(&self) -> Option<LifecycleStage> {
        self.transition.as_ref().map(|t| t.to_stage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelReport {
    pub funnel: Vec<FunnelStep>,
    /// Product of the step rates that could be computed; `None` when the
    /// log holds no step with a known rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_conversion: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedContact {
    pub contact: ContactRecord,
    pub result: EnrichmentResult,
    /// Fields the provider filled in.
    pub filled: Vec<String>,
}
