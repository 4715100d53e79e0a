//! The service facade: every externally reachable operation, independent of
//! any web framework.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crm_lifecycle::{ActionRegistry, LifecycleEngine, StageTable, StageTransition, TransitionLog};
use crm_sync::{
    AdapterRegistry, ConflictQuery, ConflictRecord, ConflictStrategy, JobStatus, MappingSet,
    MemoryConflictStore, MemoryJobStore, SyncJobSpec, SyncOrchestrator,
};
use crm_types::{
    ContactRecord, CrmError, EnrichmentProvider, FieldMap, LifecycleStage, ObjectType, Result,
};

use crate::api::{
    ConfigureMapping, ConflictResolved, EnrichedContact, EvaluationResult, FunnelReport,
    JobDescriptor, LifecycleEvaluation, MappingConfigured, ResolveConflict, StageDefinition,
    StageSummary, SubmitSyncJob,
};
use crate::enrichment::merge_absent;
use crate::mappings::MappingRegistry;
use crate::settings::Settings;

/// A job run in progress; `done` flips to true when the run returns.
/// `resume_requested` is set when a resume arrives while a cancelled run is
/// still draining its batch; the run task then starts again from the cursor.
struct ActiveRun {
    cancel: CancellationToken,
    resume_requested: bool,
    done: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct CrmService {
    settings: Arc<Settings>,
    lifecycle: Arc<LifecycleEngine>,
    actions: Arc<ActionRegistry>,
    transitions: Arc<TransitionLog>,
    sync: Arc<SyncOrchestrator>,
    mappings: MappingRegistry,
    active: Arc<DashMap<Uuid, ActiveRun>>,
    enrichment: Option<Arc<dyn EnrichmentProvider>>,
}

impl CrmService {
    /// Build the service around an orchestrator. The stock stage table is
    /// installed using the settings' MQL threshold.
    pub fn new(settings: Settings, sync: SyncOrchestrator, actions: ActionRegistry) -> Result<Self> {
        settings.validate()?;
        let lifecycle = LifecycleEngine::with_defaults(settings.engagement_score_threshold_mql);
        lifecycle.set_enabled(settings.lifecycle_automation_enabled);
        Ok(Self {
            transitions: Arc::new(TransitionLog::new(settings.transition_history)),
            settings: Arc::new(settings),
            lifecycle: Arc::new(lifecycle),
            actions: Arc::new(actions),
            sync: Arc::new(sync),
            mappings: MappingRegistry::new(),
            active: Arc::new(DashMap::new()),
            enrichment: None,
        })
    }

    /// Service with in-memory job and conflict stores.
    pub fn in_memory(
        settings: Settings,
        adapters: AdapterRegistry,
        actions: ActionRegistry,
    ) -> Result<Self> {
        let sync = SyncOrchestrator::new(
            adapters,
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryConflictStore::new()),
            settings.sync_config(),
        )?;
        Self::new(settings, sync, actions)
    }

    #[must_use]
    pub fn with_enrichment(mut self, provider: Arc<dyn EnrichmentProvider>) -> Self {
        self.enrichment = Some(provider);
        self
    }

    /// Swap the lifecycle engine, keeping the automation switch from settings.
    #[must_use]
    pub fn with_lifecycle(mut self, engine: LifecycleEngine) -> Self {
        engine.set_enabled(self.settings.lifecycle_automation_enabled);
        self.lifecycle = Arc::new(engine);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.sync
    }

    pub fn lifecycle(&self) -> &LifecycleEngine {
        &self.lifecycle
    }

    // -----------------------------------------------------------------------
    // Sync jobs
    // -----------------------------------------------------------------------

    /// Validate a submission, persist the job and start running it in the
    /// background.
    pub async fn submit_sync_job(&self, request: SubmitSyncJob) -> Result<JobDescriptor> {
        let spec = self.build_spec(request)?;
        let job = self.sync.submit(spec).await?;
        self.spawn_run(job.id);
        Ok(JobDescriptor::from_job(&job, true))
    }

    fn build_spec(&self, request: SubmitSyncJob) -> Result<SyncJobSpec> {
        if request.objects.is_empty() {
            return Err(CrmError::Configuration(
                "a sync job needs at least one object type".into(),
            ));
        }
        let object_types = request
            .objects
            .iter()
            .map(|name| ObjectType::from_str(name))
            .collect::<Result<Vec<_>>>()?;

        let mut mappings = MappingSet::new();
        for (name, mapping) in request.field_mapping {
            mappings.insert(ObjectType::from_str(&name)?, mapping);
        }
        let missing: Vec<ObjectType> = object_types
            .iter()
            .copied()
            .filter(|ot| mappings.get(*ot).is_none())
            .collect();
        if !missing.is_empty() {
            let stored = self
                .mappings
                .resolve(&request.source, &request.target, &missing)?;
            for ot in missing {
                if let Some(mapping) = stored.get(ot) {
                    mappings.insert(ot, mapping.clone());
                }
            }
        }

        let strategy = match &request.conflict_resolution {
            Some(tag) => ConflictStrategy::parse_or_manual(tag),
            None => self.settings.default_strategy()?,
        };

        let mut spec = SyncJobSpec::new(request.source, request.target, object_types, mappings)
            .strategy(strategy)
            .strict(request.strict);
        for (name, field) in request.match_fields {
            spec = spec.match_on(ObjectType::from_str(&name)?, field);
        }
        Ok(spec)
    }

    fn spawn_run(&self, job_id: Uuid) {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(false);
        match self.active.entry(job_id) {
            Entry::Occupied(mut slot) => {
                let run = slot.get_mut();
                if run.cancel.is_cancelled() {
                    run.resume_requested = true;
                    tracing::debug!(job_id = %job_id, "Resume queued behind a cancelled run");
                }
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveRun {
                    cancel: cancel.clone(),
                    resume_requested: false,
                    done: rx,
                });
            }
        }

        let sync = self.sync.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let mut cancel = cancel;
            loop {
                let terminal = match sync.run(job_id, cancel).await {
                    Ok(job) => {
                        tracing::debug!(job_id = %job_id, status = %job.status, "Sync run returned");
                        job.is_terminal()
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Sync run could not start");
                        true
                    }
                };
                // Checked under the entry lock so a concurrent resume is
                // either seen here or starts a fresh run after removal.
                let Entry::Occupied(mut slot) = active.entry(job_id) else {
                    break;
                };
                if terminal || !slot.get().resume_requested {
                    slot.remove();
                    break;
                }
                let next = CancellationToken::new();
                let run = slot.get_mut();
                run.resume_requested = false;
                run.cancel = next.clone();
                cancel = next;
                tracing::info!(job_id = %job_id, "Sync job resumed after cancellation");
            }
            let _ = tx.send(true);
        });
    }

    fn is_active(&self, job_id: Uuid) -> bool {
        self.active.contains_key(&job_id)
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobDescriptor> {
        let job = self.sync.job(job_id).await?;
        Ok(JobDescriptor::from_job(&job, self.is_active(job_id)))
    }

    /// Job history, newest first.
    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<JobDescriptor>> {
        let jobs = self.sync.job_store().list().await?;
        Ok(jobs
            .iter()
            .take(limit)
            .map(|job| JobDescriptor::from_job(job, self.is_active(job.id)))
            .collect())
    }

    /// Ask a running job to stop at its next batch boundary. The job stays
    /// `running` and can be resumed.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<JobDescriptor> {
        let job = self.sync.job(job_id).await?;
        if job.is_terminal() {
            return Err(CrmError::InvalidJobTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: "cancelled".into(),
            });
        }
        if let Some(mut run) = self.active.get_mut(&job_id) {
            run.resume_requested = false;
            run.cancel.cancel();
            tracing::info!(job_id = %job_id, "Sync job cancellation requested");
        }
        Ok(JobDescriptor::from_job(&job, self.is_active(job_id)))
    }

    /// Start another run of a paused job from its persisted cursor.
    pub async fn resume_job(&self, job_id: Uuid) -> Result<JobDescriptor> {
        let job = self.sync.job(job_id).await?;
        if job.is_terminal() {
            return Err(CrmError::InvalidJobTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }
        self.spawn_run(job_id);
        tracing::info!(job_id = %job_id, "Sync job resumed");
        Ok(JobDescriptor::from_job(&job, true))
    }

    /// Wait until the current run of a job (if any) returns.
    pub async fn wait_for_job(&self, job_id: Uuid) -> Result<JobDescriptor> {
        let done = self.active.get(&job_id).map(|run| run.done.clone());
        if let Some(mut done) = done {
            // A dropped sender means the run already finished.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_job_status(job_id).await
    }

    /// Submit the same job every `every` until the returned handle is
    /// stopped. Runs never overlap: the next submission waits for the
    /// previous run.
    pub fn schedule_sync(&self, request: SubmitSyncJob, every: Duration) -> ScheduledSync {
        let cancel = CancellationToken::new();
        let service = self.clone();
        let stop = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            let mut runs = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match service.submit_sync_job(request.clone()).await {
                    Ok(job) => {
                        runs += 1;
                        if let Err(e) = service.wait_for_job(job.sync_id).await {
                            tracing::warn!(error = %e, "Scheduled sync status unavailable");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Scheduled sync submission rejected");
                    }
                }
            }
            runs
        });
        ScheduledSync { cancel, handle }
    }

    /// Scheduled sync at the configured `sync_interval_seconds`.
    pub fn schedule_sync_default(&self, request: SubmitSyncJob) -> ScheduledSync {
        self.schedule_sync(request, self.settings.sync_interval())
    }

    // -----------------------------------------------------------------------
    // Mappings and conflicts
    // -----------------------------------------------------------------------

    pub fn configure_field_mapping(&self, request: ConfigureMapping) -> Result<MappingConfigured> {
        let object_type = ObjectType::from_str(&request.object_type)?;
        self.mappings.configure(
            &request.source,
            &request.target,
            object_type,
            request.mapping.clone(),
        )?;
        Ok(MappingConfigured {
            source: request.source,
            target: request.target,
            object_type,
            mapping: request.mapping,
            configured_at: Utc::now(),
        })
    }

    pub async fn list_unresolved_conflicts(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        self.sync
            .conflict_store()
            .list(&ConflictQuery::unresolved(limit))
            .await
    }

    /// Resolve one conflict and push the chosen value to the target record.
    ///
    /// The resolution is final once stored; a failed push is reported in the
    /// response but does not undo it.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        request: ResolveConflict,
    ) -> Result<ConflictResolved> {
        let strategy = ConflictStrategy::from_str(&request.strategy)?;
        let conflict = self
            .sync
            .conflict_store()
            .resolve(conflict_id, request.value, strategy.as_str(), Utc::now())
            .await?;
        tracing::info!(
            conflict_id = %conflict.id,
            job_id = %conflict.job_id,
            field = %conflict.field,
            strategy = %strategy,
            "Conflict resolved"
        );

        let (pushed, push_error) = match self.push_resolution(&conflict).await {
            Ok(()) => (true, None),
            Err(e) => {
                tracing::warn!(conflict_id = %conflict.id, error = %e, "Resolved value not pushed to target");
                (false, Some(e.to_string()))
            }
        };
        Ok(ConflictResolved {
            conflict,
            pushed,
            push_error,
        })
    }

    async fn push_resolution(&self, conflict: &ConflictRecord) -> Result<()> {
        let value = conflict
            .resolved_value
            .clone()
            .ok_or_else(|| CrmError::ConflictResolution("conflict has no resolved value".into()))?;
        let job = self.sync.job(conflict.job_id).await?;
        let target = self.sync.adapters().get(&job.spec.target)?;
        let mut fields = FieldMap::new();
        fields.insert(conflict.field.clone(), value);
        if target
            .update(conflict.object_type, &conflict.target_id, &fields)
            .await?
        {
            Ok(())
        } else {
            Err(CrmError::not_found(
                &format!("{} record", conflict.object_type),
                &conflict.target_id,
            ))
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn configure_stage(&self, definition: StageDefinition) -> Result<StageSummary> {
        let config = definition.into_config()?;
        let stage = config.stage;
        self.lifecycle.configure_stage(config)?;
        Ok(self.stage_summary(stage, &self.lifecycle.snapshot()))
    }

    /// Replace the whole stage table.
    pub fn reconfigure_stages(&self, table: StageTable) {
        self.lifecycle.reconfigure(table);
    }

    /// Every stage in progression order, configured or not.
    pub fn list_stages(&self) -> Vec<StageSummary> {
        let table = self.lifecycle.snapshot();
        LifecycleStage::ALL
            .iter()
            .map(|stage| self.stage_summary(*stage, &table))
            .collect()
    }

    fn stage_summary(&self, stage: LifecycleStage, table: &StageTable) -> StageSummary {
        let entered = self.transitions.entered(stage);
        match table.get(stage) {
            Some(config) => StageSummary {
                name: stage,
                order: stage.order(),
                next_stage: config.next_stage,
                configured: true,
                conditions: config.conditions.clone(),
                actions: config.actions.clone(),
                entered,
            },
            None => StageSummary {
                name: stage,
                order: stage.order(),
                next_stage: None,
                configured: false,
                conditions: Vec::new(),
                actions: Vec::new(),
                entered,
            },
        }
    }

    /// Evaluate one contact; on a transition, run its actions and log it.
    pub async fn evaluate_lifecycle(&self, contact: &ContactRecord) -> LifecycleEvaluation {
        let Some(transition) = self.lifecycle.evaluate_contact(contact) else {
            return LifecycleEvaluation {
                contact_id: contact.id.clone(),
                current_stage: contact.stage,
                evaluation_result: EvaluationResult::Unchanged,
                transition: None,
                actions: Vec::new(),
            };
        };

        let actions = self.lifecycle.run_actions(&transition, &self.actions).await;
        self.transitions.record(transition.clone());
        tracing::info!(
            contact_id = %contact.id,
            from = %transition.from_stage,
            to = %transition.to_stage,
            "Contact progressed"
        );
        LifecycleEvaluation {
            contact_id: contact.id.clone(),
            current_stage: contact.stage,
            evaluation_result: EvaluationResult::Progressed,
            transition: Some(transition),
            actions,
        }
    }

    pub fn list_recent_transitions(&self, limit: usize) -> Vec<StageTransition> {
        self.transitions.recent(limit)
    }

    pub fn funnel(&self) -> FunnelReport {
        let funnel = self.transitions.funnel();
        let rates: Vec<f64> = funnel.iter().filter_map(|step| step.conversion_rate).collect();
        let overall_conversion = if rates.is_empty() {
            None
        } else {
            Some(rates.iter().product())
        };
        FunnelReport {
            funnel,
            overall_conversion,
        }
    }

    // -----------------------------------------------------------------------
    // Enrichment
    // -----------------------------------------------------------------------

    /// Look the contact up by email (or domain) and fill in fields it does
    /// not have yet.
    pub async fn enrich_contact(&self, mut contact: ContactRecord) -> Result<EnrichedContact> {
        let provider = self.enrichment.as_ref().ok_or_else(|| {
            CrmError::Configuration("no enrichment provider configured".into())
        })?;
        let identifier = ["email", "domain"]
            .iter()
            .find_map(|key| contact.fields.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .ok_or_else(|| {
                CrmError::Configuration(format!(
                    "contact '{}' has no email or domain to enrich by",
                    contact.id
                ))
            })?;

        let result = provider.enrich(&identifier).await;
        let filled = if result.success {
            merge_absent(&mut contact.fields, &result.fields)
        } else {
            tracing::warn!(
                contact_id = %contact.id,
                source = %result.source,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Enrichment failed"
            );
            Vec::new()
        };
        Ok(EnrichedContact {
            contact,
            result,
            filled,
        })
    }
}

/// Handle to a recurring sync started by [`CrmService::schedule_sync`].
pub struct ScheduledSync {
    cancel: CancellationToken,
    handle: JoinHandle<usize>,
}

impl ScheduledSync {
    /// Stop scheduling and return how many jobs were submitted. A run in
    /// progress is allowed to finish.
    pub async fn stop(self) -> usize {
        self.cancel.cancel();
        self.handle.await.unwrap_or_default()
    }
}
