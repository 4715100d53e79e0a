//! Service settings.
//!
//! Loaded from `CRM_*` environment variables (after an optional `.env`) or
//! from a JSON file. Every field has a default, so a partial file is fine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crm_sync::{BackoffPolicy, ConflictStrategy, SyncConfig};
use crm_types::{CrmError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub lifecycle_automation_enabled: bool,
    pub engagement_score_threshold_mql: f64,
    /// Carried for configurations that gate sql on engagement; the stock
    /// stage table gates it on a booked meeting.
    pub engagement_score_threshold_sql: f64,
    pub sync_batch_size: usize,
    /// Default strategy tag for jobs submitted without one.
    pub conflict_resolution: String,
    pub sync_interval_seconds: u64,
    pub max_concurrency: usize,
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub consecutive_failure_threshold: usize,
    /// How many transitions the in-process log keeps.
    pub transition_history: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lifecycle_automation_enabled: true,
            engagement_score_threshold_mql: 30.0,
            engagement_score_threshold_sql: 60.0,
            sync_batch_size: 100,
            conflict_resolution: "source_wins".to_string(),
            sync_interval_seconds: 300,
            max_concurrency: 8,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            consecutive_failure_threshold: 25,
            transition_history: 500,
        }
    }
}

impl Settings {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any `CRM_*` key lookup. Missing or unparsable
    /// values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            default: T,
        ) -> T {
            match lookup(key) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
                    default
                }),
                None => default,
            }
        }

        let d = Self::default();
        Self {
            lifecycle_automation_enabled: parsed(
                &lookup,
                "CRM_LIFECYCLE_AUTOMATION_ENABLED",
                d.lifecycle_automation_enabled,
            ),
            engagement_score_threshold_mql: parsed(
                &lookup,
                "CRM_ENGAGEMENT_SCORE_THRESHOLD_MQL",
                d.engagement_score_threshold_mql,
            ),
            engagement_score_threshold_sql: parsed(
                &lookup,
                "CRM_ENGAGEMENT_SCORE_THRESHOLD_SQL",
                d.engagement_score_threshold_sql,
            ),
            sync_batch_size: parsed(&lookup, "CRM_SYNC_BATCH_SIZE", d.sync_batch_size),
            conflict_resolution: lookup("CRM_CONFLICT_RESOLUTION")
                .map(|s| s.trim().to_string())
                .unwrap_or(d.conflict_resolution),
            sync_interval_seconds: parsed(
                &lookup,
                "CRM_SYNC_INTERVAL_SECONDS",
                d.sync_interval_seconds,
            ),
            max_concurrency: parsed(&lookup, "CRM_MAX_CONCURRENCY", d.max_concurrency),
            max_attempts: parsed(&lookup, "CRM_MAX_ATTEMPTS", d.max_attempts),
            backoff_base_ms: parsed(&lookup, "CRM_BACKOFF_BASE_MS", d.backoff_base_ms),
            backoff_max_ms: parsed(&lookup, "CRM_BACKOFF_MAX_MS", d.backoff_max_ms),
            consecutive_failure_threshold: parsed(
                &lookup,
                "CRM_CONSECUTIVE_FAILURE_THRESHOLD",
                d.consecutive_failure_threshold,
            ),
            transition_history: parsed(&lookup, "CRM_TRANSITION_HISTORY", d.transition_history),
        }
    }

    /// Read a JSON settings file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let settings: Settings = serde_json::from_str(&raw)?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_batch_size == 0 {
            return Err(CrmError::Configuration("sync_batch_size must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(CrmError::Configuration("max_concurrency must be at least 1".into()));
        }
        if self.transition_history == 0 {
            return Err(CrmError::Configuration(
                "transition_history must be at least 1".into(),
            ));
        }
        self.default_strategy().map_err(|e| {
            CrmError::Configuration(format!("conflict_resolution: {e}"))
        })?;
        self.sync_config().validate()
    }

    pub fn default_strategy(&self) -> Result<ConflictStrategy> {
        self.conflict_resolution.parse()
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            batch_size: self.sync_batch_size,
            max_concurrency: self.max_concurrency,
            consecutive_failure_threshold: self.consecutive_failure_threshold,
            max_attempts: self.max_attempts,
            backoff: BackoffPolicy::Exponential {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            },
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }
}
