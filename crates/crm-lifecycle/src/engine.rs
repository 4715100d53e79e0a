//! Lifecycle stage engine: decides stage transitions for one contact at a
//! time and runs the actions attached to them.
//!
//! The engine holds the stage table and nothing else. It never writes
//! contact state; callers persist the returned [`StageTransition`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crm_types::{Clock, ContactRecord, FieldMap, LifecycleStage, Result, SystemClock};

use crate::action::{ActionRegistry, ActionResult};
use crate::condition::all_hold;
use crate::stage::{StageConfig, StageTable, StageTransition};

pub struct LifecycleEngine {
    table: RwLock<Arc<StageTable>>,
    enabled: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl LifecycleEngine {
    pub fn new(table: StageTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            enabled: AtomicBool::new(true),
            clock,
        }
    }

    /// Engine over the stock stage table, on the system clock.
    pub fn with_defaults(mql_engagement_threshold: f64) -> Self {
        Self::new(
            StageTable::defaults(mql_engagement_threshold),
            Arc::new(SystemClock),
        )
    }

    /// Globally switch automation on or off. While off, every evaluation
    /// returns `None`.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Current stage table. Evaluations in flight keep the snapshot they
    /// started with.
    pub fn snapshot(&self) -> Arc<StageTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole stage table.
    pub fn reconfigure(&self, table: StageTable) {
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        tracing::info!("Lifecycle stage table replaced");
    }

    /// Install or replace the config of a single stage.
    pub fn configure_stage(&self, config: StageConfig) -> Result<()> {
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut table = StageTable::clone(&guard);
        let stage = config.stage;
        table.insert(config)?;
        *guard = Arc::new(table);
        tracing::info!(stage = %stage, "Lifecycle stage configured");
        Ok(())
    }

    pub fn stage_config(&self, stage: LifecycleStage) -> Option<StageConfig> {
        self.snapshot().get(stage).cloned()
    }

    /// Decide whether a contact leaves `current_stage`, timestamped with the
    /// engine clock.
    pub fn evaluate_transition(
        &self,
        contact_id: &str,
        current_stage: LifecycleStage,
        fields: &FieldMap,
    ) -> Option<StageTransition> {
        self.evaluate_transition_at(contact_id, current_stage, fields, self.clock.now())
    }

    /// Decide whether a contact leaves `current_stage`.
    ///
    /// Returns `None` when automation is disabled, when the stage has no
    /// config or is terminal, or when any condition does not hold. The
    /// decision depends only on the arguments and the stage table.
    pub fn evaluate_transition_at(
        &self,
        contact_id: &str,
        current_stage: LifecycleStage,
        fields: &FieldMap,
        now: DateTime<Utc>,
    ) -> Option<StageTransition> {
        if !self.is_enabled() {
            return None;
        }

        let table = self.snapshot();
        let config = table.get(current_stage)?;
        let next_stage = config.next_stage?;

        if !all_hold(&config.conditions, fields) {
            tracing::debug!(contact_id, stage = %current_stage, "Stage conditions not met");
            return None;
        }

        tracing::debug!(
            contact_id,
            from = %current_stage,
            to = %next_stage,
            "Stage transition decided"
        );
        Some(StageTransition {
            contact_id: contact_id.to_string(),
            from_stage: current_stage,
            to_stage: next_stage,
            trigger: format!("conditions_met: {}", config.describe_conditions()),
            timestamp: now,
        })
    }

    pub fn evaluate_contact(&self, contact: &ContactRecord) -> Option<StageTransition> {
        self.evaluate_transition(&contact.id, contact.stage, &contact.fields)
    }

    /// Run the actions configured for a transition, best-effort.
    pub async fn execute_transition_actions(
        &self,
        transition: &StageTransition,
        config: &StageConfig,
        registry: &ActionRegistry,
    ) -> Vec<ActionResult> {
        let results = registry.execute_all(&config.actions, transition).await;
        let failed = results.iter().filter(|r| !r.success).count();
        tracing::info!(
            contact_id = %transition.contact_id,
            to = %transition.to_stage,
            actions = results.len(),
            failed,
            "Transition actions executed"
        );
        results
    }

    /// [`execute_transition_actions`](Self::execute_transition_actions) using
    /// the current config of the transition's origin stage.
    pub async fn run_actions(
        &self,
        transition: &StageTransition,
        registry: &ActionRegistry,
    ) -> Vec<ActionResult> {
        match self.stage_config(transition.from_stage) {
            Some(config) => {
                self.execute_transition_actions(transition, &config, registry)
                    .await
            }
            None => Vec::new(),
        }
    }
}
