//! Sync orchestrator.
//!
//! Drives fetch → map → detect/resolve → upsert for one job. Object types run
//! concurrently; within an object type pages run strictly in order and each
//! committed page moves the persisted cursor. Records within a page run
//! concurrently on a bounded worker pool.
//!
//! Per-record failures are counted and logged, never fatal. The job fails
//! only when consecutive failures cross the configured threshold or the
//! target cannot be indexed. Cancellation is observed between pages and
//! leaves the job `running` with its cursor so [`SyncOrchestrator::run`] can
//! resume it.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crm_types::{
    Clock, CrmAdapter, CrmError, FieldMap, ObjectType, Record, Result, SystemClock,
};

use crate::adapters::AdapterRegistry;
use crate::conflict::{detect, resolve, ConflictRecord, ConflictStrategy, Resolution};
use crate::events::{EventEmitter, SyncEvent};
use crate::job::{JobStatus, RecordOutcome, SyncJob, SyncJobSpec};
use crate::mapper::FieldMapper;
use crate::retry::{retry_transient, BackoffPolicy};
use crate::store::{ConflictStore, JobStore};

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Records per source page.
    pub batch_size: usize,
    /// Records of one page processed at the same time.
    pub max_concurrency: usize,
    /// The job fails once more than this many failures happen in a row.
    pub consecutive_failure_threshold: usize,
    /// Attempts per adapter call for transient errors.
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_concurrency: 8,
            consecutive_failure_threshold: 25,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CrmError::Configuration("batch_size must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(CrmError::Configuration(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.consecutive_failure_threshold == 0 {
            return Err(CrmError::Configuration(
                "consecutive_failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SyncOrchestrator
// ---------------------------------------------------------------------------

pub struct SyncOrchestrator {
    adapters: AdapterRegistry,
    jobs: Arc<dyn JobStore>,
    conflicts: Arc<dyn ConflictStore>,
    events: EventEmitter,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(
        adapters: AdapterRegistry,
        jobs: Arc<dyn JobStore>,
        conflicts: Arc<dyn ConflictStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            adapters,
            jobs,
            conflicts,
            events: EventEmitter::default(),
            clock: Arc::new(SystemClock),
            config,
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn conflict_store(&self) -> &Arc<dyn ConflictStore> {
        &self.conflicts
    }

    /// Validate a spec and persist a new `running` job for it. Configuration
    /// problems surface here, before any record is touched.
    pub async fn submit(&self, spec: SyncJobSpec) -> Result<SyncJob> {
        spec.validate()?;
        self.adapters.get(&spec.source)?;
        self.adapters.get(&spec.target)?;
        let job = SyncJob::new(spec, self.clock.now());
        self.jobs.save(&job).await?;
        tracing::info!(
            job_id = %job.id,
            source = %job.spec.source,
            target = %job.spec.target,
            strategy = %job.spec.strategy,
            "Sync job submitted"
        );
        Ok(job)
    }

    pub async fn job(&self, id: Uuid) -> Result<SyncJob> {
        self.jobs
            .load(id)
            .await?
            .ok_or_else(|| CrmError::not_found("sync job", id))
    }

    /// Run (or resume) a job until it finishes, fails, or `cancel` fires.
    ///
    /// Returns the job as persisted. A cancelled job is still `running`.
    pub async fn run(&self, job_id: Uuid, cancel: CancellationToken) -> Result<SyncJob> {
        let job = self.job(job_id).await?;
        if job.is_terminal() {
            return Err(CrmError::InvalidJobTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }
        let source = self.adapters.get(&job.spec.source)?;
        let target = self.adapters.get(&job.spec.target)?;
        let spec = job.spec.clone();
        let started = Instant::now();

        tracing::info!(
            job_id = %job_id,
            source = %spec.source,
            target = %spec.target,
            "Sync job started"
        );
        self.events.emit(SyncEvent::JobStarted {
            job_id,
            source: spec.source.clone(),
            target: spec.target.clone(),
            object_types: spec.object_types.clone(),
        });

        let mapper = Arc::new(FieldMapper::new(spec.mappings.clone()));
        let state = Arc::new(Mutex::new(job));
        // Trips when one object type fails the job so the others stop too.
        let halt = cancel.child_token();

        let runs = spec.object_types.iter().map(|object_type| {
            let run = ObjectRun {
                job_id,
                object_type: *object_type,
                spec: &spec,
                source: source.clone(),
                target: target.clone(),
                mapper: mapper.clone(),
                state: state.clone(),
            };
            self.sync_object(run, &cancel, &halt)
        });
        let results = futures::future::join_all(runs).await;

        let mut job = state.lock().await;
        for result in results {
            if let Err(e) = result {
                tracing::error!(job_id = %job_id, error = %e, "Sync job aborted");
                if !job.is_terminal() {
                    job.fail(format!("aborted: {e}"), self.clock.now())?;
                }
            }
        }

        match job.status {
            JobStatus::Failed => {
                self.jobs.save(&job).await?;
                let error = job.failure_reason.clone().unwrap_or_default();
                tracing::warn!(job_id = %job_id, errors = job.errors, %error, "Sync job failed");
                self.events.emit(SyncEvent::JobFailed { job_id, error });
            }
            JobStatus::Running if job.all_done() => {
                job.complete(self.clock.now())?;
                self.jobs.save(&job).await?;
                tracing::info!(
                    job_id = %job_id,
                    records_synced = job.records_synced,
                    errors = job.errors,
                    conflicts = job.conflicts_detected,
                    "Sync job completed"
                );
                self.events.emit(SyncEvent::JobCompleted {
                    job_id,
                    records_synced: job.records_synced,
                    errors: job.errors,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            JobStatus::Running => {
                self.jobs.save(&job).await?;
                tracing::info!(job_id = %job_id, "Sync job cancelled at batch boundary");
                self.events.emit(SyncEvent::JobCancelled { job_id });
            }
            JobStatus::Completed => {}
        }
        Ok(job.clone())
    }

    async fn sync_object(
        &self,
        run: ObjectRun<'_>,
        cancel: &CancellationToken,
        halt: &CancellationToken,
    ) -> Result<()> {
        let ObjectRun {
            job_id,
            object_type,
            spec,
            source,
            target,
            mapper,
            state,
        } = run;
        let batch_size = self.config.batch_size;
        let match_field = spec.match_field(object_type).to_string();

        if state.lock().await.cursor(object_type).done {
            return Ok(());
        }

        let index = match self.index_target(&target, object_type, &match_field).await {
            Ok(index) => Arc::new(index),
            Err(e) => {
                let now = self.clock.now();
                let mut job = state.lock().await;
                if !job.is_terminal() {
                    job.record_error(object_type, "target index", e.to_string(), now)?;
                    job.fail(
                        format!("could not index {} {object_type} records: {e}", target.system_id()),
                        now,
                    )?;
                }
                halt.cancel();
                return Ok(());
            }
        };

        let ctx = Arc::new(RecordContext {
            job_id,
            object_type,
            strategy: spec.strategy,
            strict: spec.strict,
            match_field,
            target,
            mapper,
            index,
            conflicts: self.conflicts.clone(),
            events: self.events.clone(),
            clock: self.clock.clone(),
            max_attempts: self.config.max_attempts,
            backoff: self.config.backoff.clone(),
        });
        let pool = Arc::new(Semaphore::new(self.config.max_concurrency));

        loop {
            if cancel.is_cancelled() || halt.is_cancelled() {
                return Ok(());
            }
            let offset = {
                let job = state.lock().await;
                let cursor = job.cursor(object_type);
                if job.is_terminal() || cursor.done {
                    return Ok(());
                }
                cursor.offset
            };

            let fetched = retry_transient(
                &format!("fetch {object_type} page at {offset}"),
                self.config.max_attempts,
                &self.config.backoff,
                || source.fetch(object_type, batch_size, offset),
            )
            .await;

            let page = match fetched {
                Ok(page) => page,
                Err(e) => {
                    // The same page is fetched again on the next pass.
                    let now = self.clock.now();
                    let mut job = state.lock().await;
                    if job.is_terminal() {
                        return Ok(());
                    }
                    let marker = format!("page@{offset}");
                    tracing::warn!(job_id = %job_id, %object_type, offset, error = %e, "Page fetch failed");
                    self.events.emit(SyncEvent::RecordFailed {
                        job_id,
                        object_type,
                        record_id: marker.clone(),
                        error: e.to_string(),
                    });
                    job.record_error(object_type, marker, e.to_string(), now)?;
                    if self.threshold_crossed(&job) {
                        self.trip(&mut job, halt, now)?;
                    }
                    self.jobs.save(&job).await?;
                    let failures = job.consecutive_failures;
                    drop(job);

                    let delay = self
                        .config
                        .backoff
                        .delay_for_attempt(failures.saturating_sub(1));
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {}
                            _ = halt.cancelled() => {}
                        }
                    }
                    continue;
                }
            };

            if page.is_empty() {
                let mut job = state.lock().await;
                if !job.is_terminal() {
                    job.mark_exhausted(object_type, self.clock.now())?;
                    self.jobs.save(&job).await?;
                }
                return Ok(());
            }

            let page_len = page.len();
            let outcomes = process_batch(&ctx, &pool, page).await;

            let now = self.clock.now();
            let mut job = state.lock().await;
            if job.is_terminal() {
                return Ok(());
            }
            let mut tripped = false;
            for (record_id, outcome) in outcomes {
                match outcome {
                    Ok(outcome) => job.record_success(outcome)?,
                    Err(e) => {
                        tracing::warn!(
                            job_id = %job_id,
                            %object_type,
                            record_id = %record_id,
                            error = %e,
                            "Record sync failed"
                        );
                        self.events.emit(SyncEvent::RecordFailed {
                            job_id,
                            object_type,
                            record_id: record_id.clone(),
                            error: e.to_string(),
                        });
                        job.record_error(object_type, record_id, e.to_string(), now)?;
                    }
                }
                tripped |= self.threshold_crossed(&job);
            }

            let cursor = job.advance(object_type, page_len, batch_size, now)?;
            if tripped {
                self.trip(&mut job, halt, now)?;
            }
            self.jobs.save(&job).await?;
            tracing::info!(
                job_id = %job_id,
                %object_type,
                batch = cursor.batches,
                offset = cursor.offset,
                records = page_len,
                "Batch committed"
            );
            self.events.emit(SyncEvent::BatchCommitted {
                job_id,
                object_type,
                batch: cursor.batches,
                offset: cursor.offset,
                records: page_len,
            });

            if tripped || cursor.done {
                return Ok(());
            }
        }
    }

    fn threshold_crossed(&self, job: &SyncJob) -> bool {
        job.consecutive_failures > self.config.consecutive_failure_threshold
    }

    fn trip(&self, job: &mut SyncJob, halt: &CancellationToken, now: DateTime<Utc>) -> Result<()> {
        job.fail(
            format!(
                "{} consecutive failures (threshold {})",
                job.consecutive_failures, self.config.consecutive_failure_threshold
            ),
            now,
        )?;
        halt.cancel();
        Ok(())
    }

    /// Page through the target and key its records by the match field.
    async fn index_target(
        &self,
        target: &Arc<dyn CrmAdapter>,
        object_type: ObjectType,
        match_field: &str,
    ) -> Result<DashMap<String, Record>> {
        let index = DashMap::new();
        let batch_size = self.config.batch_size;
        let mut offset = 0;
        loop {
            let page = retry_transient(
                &format!("index {object_type} at {offset}"),
                self.config.max_attempts,
                &self.config.backoff,
                || target.fetch(object_type, batch_size, offset),
            )
            .await?;
            let len = page.len();
            for record in page {
                if let Some(key) = record.get(match_field).map(ToString::to_string) {
                    index.entry(key).or_insert(record);
                }
            }
            if len < batch_size {
                break;
            }
            offset += len;
        }
        tracing::debug!(%object_type, records = index.len(), "Target indexed");
        Ok(index)
    }
}

struct ObjectRun<'a> {
    job_id: Uuid,
    object_type: ObjectType,
    spec: &'a SyncJobSpec,
    source: Arc<dyn CrmAdapter>,
    target: Arc<dyn CrmAdapter>,
    mapper: Arc<FieldMapper>,
    state: Arc<Mutex<SyncJob>>,
}

// ---------------------------------------------------------------------------
// Per-record pipeline
// ---------------------------------------------------------------------------

/// Everything a record worker needs; shared by all workers of one object type.
struct RecordContext {
    job_id: Uuid,
    object_type: ObjectType,
    strategy: ConflictStrategy,
    strict: bool,
    match_field: String,
    target: Arc<dyn CrmAdapter>,
    mapper: Arc<FieldMapper>,
    /// Target records by match key; updated as records are written.
    index: Arc<DashMap<String, Record>>,
    conflicts: Arc<dyn ConflictStore>,
    events: EventEmitter,
    clock: Arc<dyn Clock>,
    max_attempts: usize,
    backoff: BackoffPolicy,
}

impl RecordContext {
    async fn sync_record(&self, record: Record) -> Result<RecordOutcome> {
        let ot = self.object_type;
        let mapped = self.mapper.map(ot, &record, self.strict)?;
        let key = match mapped.get(&self.match_field) {
            Some(v) if !v.is_null() => v.to_string(),
            _ => {
                return Err(CrmError::UnmappedField {
                    object_type: ot.to_string(),
                    field: self.match_field.clone(),
                })
            }
        };

        let existing = self.index.get(&key).map(|r| r.clone());
        let Some(current) = existing else {
            let id = retry_transient(
                &format!("create {ot} {}", record.id),
                self.max_attempts,
                &self.backoff,
                || self.target.create(ot, &mapped),
            )
            .await?;
            self.index.insert(
                key,
                Record {
                    id,
                    fields: mapped,
                    modified_at: Some(self.clock.now()),
                },
            );
            return Ok(RecordOutcome::Created);
        };

        let found = detect(&mapped, &current.fields);
        let conflicts = found.len();
        let mut unresolved = 0;
        let mut payload = FieldMap::new();
        for conflict in found {
            let resolution = resolve(
                self.strategy,
                &conflict,
                record.modified_at,
                current.modified_at,
            );
            match &resolution {
                Resolution::Source(value) => {
                    payload.insert(conflict.field.clone(), value.clone());
                }
                Resolution::Target(_) => {}
                Resolution::Unresolved => unresolved += 1,
            }
            let stored = self
                .conflicts
                .insert(ConflictRecord::new(
                    self.job_id,
                    ot,
                    key.as_str(),
                    current.id.as_str(),
                    conflict,
                    self.strategy,
                    &resolution,
                    self.clock.now(),
                ))
                .await?;
            tracing::debug!(
                job_id = %self.job_id,
                record_key = %key,
                field = %stored.field,
                resolution = ?stored.status,
                "Conflict detected"
            );
            self.events.emit(SyncEvent::ConflictDetected {
                job_id: self.job_id,
                conflict_id: stored.id,
                field: stored.field,
                status: stored.status,
            });
        }

        if payload.is_empty() {
            return Ok(RecordOutcome::Unchanged {
                conflicts,
                unresolved,
            });
        }

        let updated = retry_transient(
            &format!("update {ot} {}", current.id),
            self.max_attempts,
            &self.backoff,
            || self.target.update(ot, &current.id, &payload),
        )
        .await?;
        if !updated {
            return Err(CrmError::PermanentAdapter {
                system: self.target.system_id().to_string(),
                message: format!("{ot} {} no longer exists", current.id),
            });
        }
        if let Some(mut entry) = self.index.get_mut(&key) {
            entry.fields.extend(payload);
            entry.modified_at = Some(self.clock.now());
        }
        Ok(RecordOutcome::Updated {
            conflicts,
            unresolved,
        })
    }
}

/// Sync one page on the worker pool. Results come back in page order.
async fn process_batch(
    ctx: &Arc<RecordContext>,
    pool: &Arc<Semaphore>,
    page: Vec<Record>,
) -> Vec<(String, Result<RecordOutcome>)> {
    let ids: Vec<String> = page.iter().map(|r| r.id.clone()).collect();
    let mut tasks = JoinSet::new();
    for (index, record) in page.into_iter().enumerate() {
        let ctx = ctx.clone();
        let pool = pool.clone();
        tasks.spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return (index, Err(CrmError::Other("worker pool closed".into())));
            };
            (index, ctx.sync_record(record).await)
        });
    }

    let mut results: Vec<Option<Result<RecordOutcome>>> = ids.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, outcome)) => results[index] = Some(outcome),
            Err(e) => tracing::error!(error = %e, "Record worker panicked"),
        }
    }
    ids.into_iter()
        .zip(results)
        .map(|(id, outcome)| {
            let outcome =
                outcome.unwrap_or_else(|| Err(CrmError::Other("record worker did not finish".into())));
            (id, outcome)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryAdapter;
    use crate::mapper::{FieldMapping, MappingSet};
    use crate::store::{MemoryConflictStore, MemoryJobStore};
    use crm_types::FieldValue;

    fn setup(config: SyncConfig) -> (SyncOrchestrator, Arc<MemoryAdapter>, Arc<MemoryAdapter>) {
        let source = Arc::new(MemoryAdapter::new("salesforce"));
        let target = Arc::new(MemoryAdapter::new("hubspot"));
        let adapters = AdapterRegistry::new()
            .with(source.clone())
            .with(target.clone());
        let orchestrator = SyncOrchestrator::new(
            adapters,
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryConflictStore::new()),
            config,
        )
        .unwrap();
        (orchestrator, source, target)
    }

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

    fn quick() -> SyncConfig {
        SyncConfig {
            batch_size: 5,
            backoff: BackoffPolicy::None,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn config_validation() {
        assert!(SyncConfig::default().validate().is_ok());
        let zero = SyncConfig {
            batch_size: 0,
            ..SyncConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test]
    async fn submit_rejects_unknown_systems_before_running() {
        let (orchestrator, _, _) = setup(quick());
        let mut bad = spec();
        bad.target = "pipedrive".into();
        let err = orchestrator.submit(bad).await.unwrap_err();
        assert!(matches!(err, CrmError::Configuration(_)));
        assert!(orchestrator.job_store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn creates_then_updates_with_source_wins() {
        let (orchestrator, source, target) = setup(quick());
        for i in 0..7 {
            source.seed(
                ObjectType::Contact,
                Record::new(format!("003{i}"))
                    .with_field("Email", format!("u{i}@x.com"))
                    .with_field("Phone", "555-0100"),
            );
        }
        target.seed(
            ObjectType::Contact,
            Record::new("900")
                .with_field("email", "u3@x.com")
                .with_field("phone", "555-9999"),
        );

        let job = orchestrator.submit(spec()).await.unwrap();
        let done = orchestrator
            .run(job.id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.records_synced, 7);
        assert_eq!(done.records_created, 6);
        assert_eq!(done.records_updated, 1);
        assert_eq!(done.conflicts_detected, 1);
        assert_eq!(target.count(ObjectType::Contact), 7);
        assert_eq!(
            target.find(ObjectType::Contact, "900").unwrap().get("phone"),
            Some(&FieldValue::from("555-0100"))
        );
    }

    #[tokio::test]
    async fn running_a_finished_job_is_rejected() {
        let (orchestrator, _, _) = setup(quick());
        let job = orchestrator.submit(spec()).await.unwrap();
        let done = orchestrator
            .run(job.id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.records_synced, 0);

        let err = orchestrator
            .run(job.id, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::InvalidJobTransition { .. }));
    }

    #[tokio::test]
    async fn consecutive_failures_fail_the_job() {
        let (orchestrator, source, target) = setup(SyncConfig {
            consecutive_failure_threshold: 3,
            ..quick()
        });
        for i in 0..10 {
            source.seed(
                ObjectType::Contact,
                Record::new(format!("003{i}")).with_field("Email", format!("u{i}@x.com")),
            );
        }
        for i in 0..4 {
            target.fail_writes_where("email", format!("u{i}@x.com"));
        }

        let job = orchestrator.submit(spec()).await.unwrap();
        let done = orchestrator
            .run(job.id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.failure_reason.as_ref().unwrap().contains("consecutive failures"));
        // The tripping batch is committed; nothing after it runs.
        assert_eq!(done.cursor(ObjectType::Contact).offset, 5);
        assert_eq!(done.errors, 4);
        assert_eq!(done.records_synced, 1);
    }

    #[tokio::test]
    async fn failures_up_to_the_threshold_do_not_fail_the_job() {
        let (orchestrator, source, target) = setup(SyncConfig {
            consecutive_failure_threshold: 3,
            max_attempts: 1,
            ..quick()
        });
        for i in 0..10 {
            source.seed(
                ObjectType::Contact,
                Record::new(format!("003{i}")).with_field("Email", format!("u{i}@x.com")),
            );
        }
        for i in 0..3 {
            target.fail_writes_where("email", format!("u{i}@x.com"));
        }

        let job = orchestrator.submit(spec()).await.unwrap();
        let done = orchestrator
            .run(job.id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.errors, 3);
        assert_eq!(done.records_synced, 7);
        assert_eq!(target.count(ObjectType::Contact), 7);
    }

    #[tokio::test]
    async fn transient_fetch_failures_are_retried() {
        let (orchestrator, source, target) = setup(quick());
        source.seed(
            ObjectType::Contact,
            Record::new("0031").with_field("Email", "a@x.com"),
        );
        source.fail_next_fetches(2);

        let job = orchestrator.submit(spec()).await.unwrap();
        let done = orchestrator
            .run(job.id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.errors, 0);
        assert_eq!(target.count(ObjectType::Contact), 1);
    }

    #[tokio::test]
    async fn failed_page_fetches_back_off_before_refetching() {
        let (orchestrator, source, target) = setup(SyncConfig {
            max_attempts: 1,
            backoff: BackoffPolicy::Fixed(std::time::Duration::from_millis(20)),
            ..quick()
        });
        source.seed(
            ObjectType::Contact,
            Record::new("0031").with_field("Email", "a@x.com"),
        );
        source.fail_next_fetches(2);

        let job = orchestrator.submit(spec()).await.unwrap();
        let started = Instant::now();
        let done = orchestrator
            .run(job.id, CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() >= std::time::Duration::from_millis(40));
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.errors, 2);
        assert_eq!(done.cursor(ObjectType::Contact).offset, 1);
        assert_eq!(target.count(ObjectType::Contact), 1);
    }

    #[tokio::test]
    async fn missing_match_field_is_a_record_error() {
        let (orchestrator, source, _) = setup(quick());
        source.seed(
            ObjectType::Contact,
            Record::new("0031").with_field("Phone", "555"),
        );
        let job = orchestrator.submit(spec()).await.unwrap();
        let done = orchestrator
            .run(job.id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.errors, 1);
        assert!(done.error_log[0].message.contains("email"));
    }
}
