//! End-to-end tests for the lifecycle engine: stage table -> evaluation ->
//! transition -> actions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crm_lifecycle::{
    default_registry, parse_conditions, Action, LifecycleEngine, Notifier, StageConfig,
    StageTable, TransitionLog,
};
use crm_types::{
    ContactRecord, CrmAdapter, CrmError, FieldMap, FieldValue, FixedClock, LifecycleStage,
    ObjectType, Record, Result,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine() -> LifecycleEngine {
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 3, 14, 30, 0).unwrap());
    LifecycleEngine::new(StageTable::defaults(30.0), Arc::new(clock))
}

fn fields(pairs: &[(&str, FieldValue)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// CRM stub that records writes and hands out sequential deal ids.
#[derive(Default)]
struct StubCrm {
    updates: Mutex<Vec<(String, FieldMap)>>,
    deals: Mutex<Vec<FieldMap>>,
}

#[async_trait]
impl CrmAdapter for StubCrm {
    fn system_id(&self) -> &str {
        "stub"
    }

    async fn fetch(&self, _: ObjectType, _: usize, _: usize) -> Result<Vec<Record>> {
        Ok(Vec::new())
    }

    async fn create(&self, object_type: ObjectType, fields: &FieldMap) -> Result<String> {
        if object_type != ObjectType::Deal {
            return Err(CrmError::Unsupported {
                system: "stub".into(),
                operation: format!("create {object_type}"),
            });
        }
        let mut deals = self.deals.lock().unwrap();
        deals.push(fields.clone());
        Ok(format!("deal_{}", deals.len()))
    }

    async fn update(&self, _: ObjectType, id: &str, fields: &FieldMap) -> Result<bool> {
        self.updates
            .lock()
            .unwrap()
            .push((id.to_string(), fields.clone()));
        Ok(true)
    }
}

#[derive(Default)]
struct Inbox {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for Inbox {
    async fn notify(&self, team: &str, _message: &str) -> Result<()> {
        self.messages.lock().unwrap().push(team.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[test]
fn missing_fields_never_transition() {
    let engine = engine();
    let extra: BTreeMap<_, _> = [("unrelated".to_string(), FieldValue::from("x"))].into();
    for stage in LifecycleStage::ALL {
        assert!(engine.evaluate_transition("c1", stage, &FieldMap::new()).is_none());
        assert!(engine.evaluate_transition("c1", stage, &extra).is_none());
    }

    // Null is treated as absent.
    let null_score = fields(&[("engagement_score", FieldValue::Null)]);
    assert!(engine
        .evaluate_transition("c1", LifecycleStage::Lead, &null_score)
        .is_none());
}

#[test]
fn engagement_threshold_gates_lead_to_mql() {
    let engine = engine();
    let t = engine
        .evaluate_transition(
            "c1",
            LifecycleStage::Lead,
            &fields(&[("engagement_score", FieldValue::from(35))]),
        )
        .expect("35 clears a threshold of 30");
    assert_eq!((t.from_stage, t.to_stage), (LifecycleStage::Lead, LifecycleStage::Mql));

    assert!(engine
        .evaluate_transition(
            "c1",
            LifecycleStage::Lead,
            &fields(&[("engagement_score", FieldValue::from(20))]),
        )
        .is_none());

    // Threshold is inclusive.
    assert!(engine
        .evaluate_transition(
            "c1",
            LifecycleStage::Lead,
            &fields(&[("engagement_score", FieldValue::from(30))]),
        )
        .is_some());
}

#[test]
fn meeting_scheduled_moves_mql_to_sql() {
    let engine = engine();
    let t = engine
        .evaluate_transition(
            "c2",
            LifecycleStage::Mql,
            &fields(&[("meeting_scheduled", FieldValue::Bool(true))]),
        )
        .unwrap();
    assert_eq!(t.to_stage, LifecycleStage::Sql);
    assert_eq!(t.trigger, "conditions_met: meeting_scheduled = true");

    assert!(engine
        .evaluate_transition(
            "c2",
            LifecycleStage::Mql,
            &fields(&[("meeting_scheduled", FieldValue::Bool(false))]),
        )
        .is_none());
}

#[test]
fn evaluation_is_deterministic() {
    let engine = engine();
    let input = fields(&[
        ("engagement_score", FieldValue::from(42)),
        ("email", FieldValue::from("ada@example.com")),
    ]);
    let first = engine.evaluate_transition("c3", LifecycleStage::Lead, &input);
    let second = engine.evaluate_transition("c3", LifecycleStage::Lead, &input);
    assert!(first.is_some());
    assert_eq!(first, second);
}

#[test]
fn parsed_rules_drive_a_custom_stage() {
    let engine = engine();
    let conditions =
        parse_conditions("renewals >= 2 && nps > 8 && segment != \"churn risk\"").unwrap();
    let mut config = StageConfig::new(LifecycleStage::Customer);
    config.conditions = conditions;
    engine.configure_stage(config).unwrap();

    let contact = ContactRecord::new("c4", LifecycleStage::Customer)
        .with_field("renewals", 3)
        .with_field("nps", 9)
        .with_field("segment", "enterprise");
    let t = engine.evaluate_contact(&contact).unwrap();
    assert_eq!(t.to_stage, LifecycleStage::Advocate);

    let at_risk = contact.with_field("segment", "churn risk");
    assert!(engine.evaluate_contact(&at_risk).is_none());
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sql_transition_creates_a_deal() {
    let engine = engine();
    let crm = Arc::new(StubCrm::default());
    let registry = default_registry(crm.clone(), Arc::new(Inbox::default()));

    let t = engine
        .evaluate_transition(
            "c5",
            LifecycleStage::Sql,
            &fields(&[("budget_confirmed", FieldValue::Bool(true))]),
        )
        .unwrap();
    let results = engine.run_actions(&t, &registry).await;

    assert_eq!(results.len(), 1);
    assert!(results[0].success, "{:?}", results[0].error);
    assert_eq!(results[0].detail.as_deref(), Some("created deal deal_1"));

    let deals = crm.deals.lock().unwrap();
    assert_eq!(deals[0].get("contact_id"), Some(&FieldValue::from("c5")));
    assert_eq!(deals[0].get("name"), Some(&FieldValue::from("Deal for c5")));
}

#[tokio::test]
async fn one_failing_action_does_not_stop_the_rest() {
    let engine = engine();
    let crm = Arc::new(StubCrm::default());
    let inbox = Arc::new(Inbox::default());
    let registry = default_registry(crm.clone(), inbox.clone());

    engine
        .configure_stage(
            StageConfig::new(LifecycleStage::Opportunity)
                .then(Action::Webhook {
                    url: "http://127.0.0.1:9/unreachable".into(),
                })
                .then(Action::Assign {
                    to: "account_exec".into(),
                })
                .then(Action::Notify {
                    team: "finance".into(),
                    message: None,
                }),
        )
        .unwrap();

    let t = engine
        .evaluate_transition("c6", LifecycleStage::Opportunity, &FieldMap::new())
        .unwrap();
    let results = engine.run_actions(&t, &registry).await;

    let kinds: Vec<_> = results.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(kinds, vec!["webhook", "assign", "notify"]);
    assert!(!results[0].success);
    assert!(results[1].success);
    assert!(results[2].success);

    let updates = crm.updates.lock().unwrap();
    assert_eq!(updates[0].0, "c6");
    assert_eq!(updates[0].1.get("owner"), Some(&FieldValue::from("account_exec")));
    assert_eq!(*inbox.messages.lock().unwrap(), vec!["finance"]);
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[test]
fn transitions_feed_the_funnel() {
    let engine = engine();
    let log = TransitionLog::new(50);
    for (id, score) in [("a", 10), ("b", 31), ("c", 55), ("d", 80)] {
        if let Some(t) = engine.evaluate_transition(
            id,
            LifecycleStage::Lead,
            &fields(&[("engagement_score", FieldValue::from(score))]),
        ) {
            log.record(t);
        }
    }
    if let Some(t) = engine.evaluate_transition(
        "c",
        LifecycleStage::Mql,
        &fields(&[("meeting_scheduled", FieldValue::Bool(true))]),
    ) {
        log.record(t);
    }

    assert_eq!(log.recent(1)[0].contact_id, "c");
    let funnel = log.funnel();
    assert_eq!(funnel[0].transitions, 3);
    assert_eq!(funnel[1].from, LifecycleStage::Mql);
    assert_eq!(funnel[1].conversion_rate, Some(1.0 / 3.0));
}
