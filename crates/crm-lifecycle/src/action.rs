//! Transition actions: the action vocabulary, executor trait, executor
//! registry and built-in executors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crm_types::{CrmAdapter, CrmError, FieldMap, FieldValue, Result};

use crate::stage::StageTransition;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A side effect attached to a stage transition.
///
/// Serialized as `{"type": "<kind>", "config": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum Action {
    Notify {
        team: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Assign {
        to: String,
    },
    CreateDeal {
        #[serde(default)]
        fields: FieldMap,
    },
    SetField {
        field: String,
        value: FieldValue,
    },
    Webhook {
        url: String,
    },
}

impl Action {
    /// Registry key of the executor that runs this action.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Notify { .. } => "notify",
            Action::Assign { .. } => "assign",
            Action::CreateDeal { .. } => "create_deal",
            Action::SetField { .. } => "set_field",
            Action::Webhook { .. } => "webhook",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let missing = match self {
            Action::Notify { team, .. } if team.trim().is_empty() => Some("notify.team"),
            Action::Assign { to } if to.trim().is_empty() => Some("assign.to"),
            Action::SetField { field, .. } if field.trim().is_empty() => Some("set_field.field"),
            Action::Webhook { url } if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Some("webhook.url (http/https)")
            }
            _ => None,
        };
        match missing {
            Some(what) => Err(CrmError::Configuration(format!(
                "action '{}' is missing {what}",
                self.kind()
            ))),
            None => Ok(()),
        }
    }
}

/// Observable outcome of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ActionExecutor trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// The action kind this executor handles (e.g. "notify").
    fn action_kind(&self) -> &str;

    /// Run the action for a transition and describe what was done.
    async fn execute(&self, action: &Action, transition: &StageTransition) -> Result<String>;
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ActionRegistry {
    executors: HashMap<String, Arc<dyn ActionExecutor>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: impl ActionExecutor + 'static) {
        let kind = executor.action_kind().to_string();
        self.executors.insert(kind, Arc::new(executor));
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn ActionExecutor>> {
        self.executors.get(kind)
    }

    pub fn has(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    /// Run every action for `transition`.
    ///
    /// Actions are dispatched concurrently and do not see each other's
    /// results. The returned list is in the same order as `actions`, one
    /// entry per action; a failing or unregistered action yields a failed
    /// entry and never stops the others.
    pub async fn execute_all(
        &self,
        actions: &[Action],
        transition: &StageTransition,
    ) -> Vec<ActionResult> {
        let runs = actions.iter().map(|action| self.execute_one(action, transition));
        futures::future::join_all(runs).await
    }

    async fn execute_one(&self, action: &Action, transition: &StageTransition) -> ActionResult {
        let kind = action.kind();
        let outcome = match self.get(kind) {
            Some(executor) => executor.execute(action, transition).await,
            None => Err(CrmError::Configuration(format!(
                "no executor registered for action '{kind}'"
            ))),
        };
        match outcome {
            Ok(detail) => ActionResult {
                action: kind.to_string(),
                success: true,
                detail: Some(detail),
                error: None,
                executed_at: Utc::now(),
            },
            Err(e) => {
                tracing::warn!(
                    contact_id = %transition.contact_id,
                    action = kind,
                    error = %e,
                    "Transition action failed"
                );
                ActionResult {
                    action: kind.to_string(),
                    success: false,
                    detail: None,
                    error: Some(e.to_string()),
                    executed_at: Utc::now(),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Delivery channel for team notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, team: &str, message: &str) -> Result<()>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, team: &str, message: &str) -> Result<()> {
        tracing::info!(team, message, "Lifecycle notification");
        Ok(())
    }
}

pub struct NotifyExecutor {
    notifier: Arc<dyn Notifier>,
}

impl NotifyExecutor {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl ActionExecutor for NotifyExecutor {
    fn action_kind(&self) -> &str {
        "notify"
    }

    async fn execute(&self, action: &Action, transition: &StageTransition) -> Result<String> {
        let Action::Notify { team, message } = action else {
            return Err(mismatch(self.action_kind(), action));
        };
        let text = message.clone().unwrap_or_else(|| {
            format!(
                "Contact {} moved from {} to {}",
                transition.contact_id, transition.from_stage, transition.to_stage
            )
        });
        self.notifier.notify(team, &text).await?;
        Ok(format!("notified {team}"))
    }
}

// ---------------------------------------------------------------------------
// CRM-backed executors
// ---------------------------------------------------------------------------

/// Sets the contact owner in the system of record.
pub struct AssignExecutor {
    crm: Arc<dyn CrmAdapter>,
    owner_field: String,
}

impl AssignExecutor {
    pub fn new(crm: Arc<dyn CrmAdapter>) -> Self {
        Self {
            crm,
            owner_field: "owner".to_string(),
        }
    }
}

#[async_trait]
impl ActionExecutor for AssignExecutor {
    fn action_kind(&self) -> &str {
        "assign"
    }

    async fn execute(&self, action: &Action, transition: &StageTransition) -> Result<String> {
        let Action::Assign { to } = action else {
            return Err(mismatch(self.action_kind(), action));
        };
        let mut fields = FieldMap::new();
        fields.insert(self.owner_field.clone(), FieldValue::from(to.as_str()));
        self.crm
            .update_contact(&transition.contact_id, &fields)
            .await?;
        Ok(format!("assigned to {to}"))
    }
}

/// Opens a deal for the contact. The configured fields are merged over a
/// name and contact reference derived from the transition.
pub struct CreateDealExecutor {
    crm: Arc<dyn CrmAdapter>,
}

impl CreateDealExecutor {
    pub fn new(crm: Arc<dyn CrmAdapter>) -> Self {
        Self { crm }
    }
}

#[async_trait]
impl ActionExecutor for CreateDealExecutor {
    fn action_kind(&self) -> &str {
        "create_deal"
    }

    async fn execute(&self, action: &Action, transition: &StageTransition) -> Result<String> {
        let Action::CreateDeal { fields } = action else {
            return Err(mismatch(self.action_kind(), action));
        };
        let mut deal = FieldMap::new();
        deal.insert(
            "name".into(),
            FieldValue::Text(format!("Deal for {}", transition.contact_id)),
        );
        deal.insert(
            "contact_id".into(),
            FieldValue::Text(transition.contact_id.clone()),
        );
        deal.insert("stage".into(), FieldValue::from("qualification"));
        deal.extend(fields.clone());
        let id = self.crm.create_deal(&deal).await?;
        Ok(format!("created deal {id}"))
    }
}

/// Writes one field on the contact.
pub struct SetFieldExecutor {
    crm: Arc<dyn CrmAdapter>,
}

impl SetFieldExecutor {
    pub fn new(crm: Arc<dyn CrmAdapter>) -> Self {
        Self { crm }
    }
}

#[async_trait]
impl ActionExecutor for SetFieldExecutor {
    fn action_kind(&self) -> &str {
        "set_field"
    }

    async fn execute(&self, action: &Action, transition: &StageTransition) -> Result<String> {
        let Action::SetField { field, value } = action else {
            return Err(mismatch(self.action_kind(), action));
        };
        let mut fields = FieldMap::new();
        fields.insert(field.clone(), value.clone());
        self.crm
            .update_contact(&transition.contact_id, &fields)
            .await?;
        Ok(format!("set {field} = {value}"))
    }
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// POSTs the transition as JSON.
pub struct WebhookExecutor {
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for WebhookExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionExecutor for WebhookExecutor {
    fn action_kind(&self) -> &str {
        "webhook"
    }

    async fn execute(&self, action: &Action, transition: &StageTransition) -> Result<String> {
        let Action::Webhook { url } = action else {
            return Err(mismatch(self.action_kind(), action));
        };
        let response = self
            .client
            .post(url)
            .json(transition)
            .send()
            .await
            .map_err(|e| CrmError::Other(format!("webhook {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrmError::Other(format!("webhook {url} returned {status}")));
        }
        Ok(format!("posted to {url} ({status})"))
    }
}

fn mismatch(kind: &str, action: &Action) -> CrmError {
    CrmError::Other(format!(
        "executor '{kind}' cannot run action '{}'",
        action.kind()
    ))
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

/// Registry with every built-in executor. CRM-backed actions write to `crm`.
pub fn default_registry(crm: Arc<dyn CrmAdapter>, notifier: Arc<dyn Notifier>) -> ActionRegistry {
    let mut reg = ActionRegistry::new();
    reg.register(NotifyExecutor::new(notifier));
    reg.register(AssignExecutor::new(crm.clone()));
    reg.register(CreateDealExecutor::new(crm.clone()));
    reg.register(SetFieldExecutor::new(crm));
    reg.register(WebhookExecutor::new());
    reg
}
