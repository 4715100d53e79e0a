//! Stage configuration, the validated stage table, and transition facts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crm_types::{CrmError, LifecycleStage, Result};

use crate::action::Action;
use crate::condition::{Condition, Operator};

/// Gate and follow-on actions for leaving one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage: LifecycleStage,
    /// `None` marks the stage terminal.
    pub next_stage: Option<LifecycleStage>,
    /// All must hold for the transition to fire.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Run in order after a transition out of `stage`.
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl StageConfig {
    /// A config that progresses to the default next stage with no gate.
    pub fn new(stage: LifecycleStage) -> Self {
        Self {
            stage,
            next_stage: stage.next(),
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    #[must_use]
    pub fn terminal(mut self) -> Self {
        self.next_stage = None;
        self
    }

    #[must_use]
    pub fn to(mut self, next: LifecycleStage) -> Self {
        self.next_stage = Some(next);
        self
    }

    #[must_use]
    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn then(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Check the rule before it is installed rather than at evaluation time.
    pub fn validate(&self) -> Result<()> {
        if let Some(next) = self.next_stage {
            if next <= self.stage {
                return Err(CrmError::Configuration(format!(
                    "stage '{}' cannot progress to '{}': next stage must come later",
                    self.stage, next
                )));
            }
        }
        for condition in &self.conditions {
            condition.validate()?;
        }
        for action in &self.actions {
            action.validate()?;
        }
        Ok(())
    }

    /// Human-readable summary of the gate, used as a transition trigger.
    pub fn describe_conditions(&self) -> String {
        if self.conditions.is_empty() {
            return "unconditional".to_string();
        }
        self.conditions
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

// ---------------------------------------------------------------------------
// StageTable
// ---------------------------------------------------------------------------

/// Validated stage graph: at most one config per stage, each progressing
/// strictly forward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTable {
    stages: BTreeMap<LifecycleStage, StageConfig>,
}

impl StageTable {
    pub fn new(configs: impl IntoIterator<Item = StageConfig>) -> Result<Self> {
        let mut table = Self::default();
        for config in configs {
            if table.stages.contains_key(&config.stage) {
                return Err(CrmError::Configuration(format!(
                    "stage '{}' configured twice",
                    config.stage
                )));
            }
            table.insert(config)?;
        }
        Ok(table)
    }

    /// The stock funnel: lead→mql on engagement, mql→sql on a booked
    /// meeting, sql→opportunity on confirmed budget. Later stages are terminal
    /// until configured.
    pub fn defaults(mql_engagement_threshold: f64) -> Self {
        let lead = StageConfig::new(LifecycleStage::Lead)
            .when(Condition::new(
                "engagement_score",
                Operator::Gte,
                mql_engagement_threshold,
            ))
            .then(Action::Notify {
                team: "marketing".into(),
                message: None,
            });
        let mql = StageConfig::new(LifecycleStage::Mql)
            .when(Condition::new("meeting_scheduled", Operator::Eq, true))
            .then(Action::Assign {
                to: "sales_team".into(),
            })
            .then(Action::Notify {
                team: "sales".into(),
                message: None,
            });
        let sql = StageConfig::new(LifecycleStage::Sql)
            .when(Condition::new("budget_confirmed", Operator::Eq, true))
            .then(Action::CreateDeal {
                fields: Default::default(),
            });

        let mut stages = BTreeMap::new();
        for config in [lead, mql, sql] {
            stages.insert(config.stage, config);
        }
        Self { stages }
    }

    /// Install or replace the config for one stage.
    pub fn insert(&mut self, config: StageConfig) -> Result<()> {
        config.validate()?;
        self.stages.insert(config.stage, config);
        Ok(())
    }

    pub fn remove(&mut self, stage: LifecycleStage) -> Option<StageConfig> {
        self.stages.remove(&stage)
    }

    pub fn get(&self, stage: LifecycleStage) -> Option<&StageConfig> {
        self.stages.get(&stage)
    }

    /// Configs in progression order.
    pub fn iter(&self) -> impl Iterator<Item = &StageConfig> {
        self.stages.values()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Load and validate a table from its JSON list form.
    pub fn from_json(json: &str) -> Result<Self> {
        let configs: Vec<StageConfig> = serde_json::from_str(json)?;
        Self::new(configs)
    }
}

// ---------------------------------------------------------------------------
// StageTransition
// ---------------------------------------------------------------------------

/// A stage change that has been decided. Persisting it is the caller's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub contact_id: String,
    pub from_stage: LifecycleStage,
    pub to_stage: LifecycleStage,
    pub trigger: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_first_three_stages() {
        let table = StageTable::defaults(30.0);
        assert_eq!(table.len(), 3);
        let lead = table.get(LifecycleStage::Lead).unwrap();
        assert_eq!(lead.next_stage, Some(LifecycleStage::Mql));
        assert_eq!(lead.describe_conditions(), "engagement_score >= 30");
        assert_eq!(
            table.get(LifecycleStage::Sql).unwrap().next_stage,
            Some(LifecycleStage::Opportunity)
        );
        assert!(table.get(LifecycleStage::Customer).is_none());
    }

    #[test]
    fn backward_progression_rejected() {
        let config = StageConfig::new(LifecycleStage::Sql).to(LifecycleStage::Lead);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CrmError::Configuration(_)));

        let same = StageConfig::new(LifecycleStage::Sql).to(LifecycleStage::Sql);
        assert!(same.validate().is_err());
    }

    #[test]
    fn skipping_ahead_is_allowed_when_configured() {
        let config = StageConfig::new(LifecycleStage::Customer).to(LifecycleStage::Advocate);
        assert!(config.validate().is_ok());
        let jump = StageConfig::new(LifecycleStage::Lead).to(LifecycleStage::Sql);
        assert!(jump.validate().is_ok());
    }

    #[test]
    fn duplicate_stage_rejected() {
        let err = StageTable::new([
            StageConfig::new(LifecycleStage::Lead),
            StageConfig::new(LifecycleStage::Lead),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn invalid_condition_field_rejected_at_insert() {
        let mut table = StageTable::default();
        let bad = StageConfig::new(LifecycleStage::Lead).when(Condition::new(
            "engagement score",
            Operator::Gte,
            1,
        ));
        assert!(table.insert(bad).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn terminal_stage_has_no_next() {
        let config = StageConfig::new(LifecycleStage::Advocate);
        assert_eq!(config.next_stage, None);
        let config = StageConfig::new(LifecycleStage::Customer).terminal();
        assert_eq!(config.next_stage, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn table_loads_from_json() {
        let json = r#"[
            {
                "stage": "lead",
                "next_stage": "mql",
                "conditions": [{"field": "engagement_score", "operator": "gte", "value": 40}],
                "actions": [{"type": "notify", "config": {"team": "marketing"}}]
            },
            {"stage": "customer", "next_stage": null}
        ]"#;
        let table = StageTable::from_json(json).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(LifecycleStage::Lead).unwrap().actions,
            vec![Action::Notify {
                team: "marketing".into(),
                message: None
            }]
        );
        assert_eq!(table.get(LifecycleStage::Customer).unwrap().next_stage, None);
    }

    #[test]
    fn unconditional_description() {
        assert_eq!(
            StageConfig::new(LifecycleStage::Lead).describe_conditions(),
            "unconditional"
        );
    }
}
