//! Lifecycle stage engine: condition language, stage table, transition
//! decisions and transition actions.

pub mod action;
pub mod condition;
pub mod engine;
pub mod history;
pub mod stage;

pub use action::{
    default_registry, Action, ActionExecutor, ActionRegistry, ActionResult, AssignExecutor,
    CreateDealExecutor, LogNotifier, NotifyExecutor, Notifier, SetFieldExecutor, WebhookExecutor,
};
pub use condition::{
    all_hold, evaluate, evaluate_raw, parse_condition, parse_conditions, Condition, Operator,
};
pub use engine::LifecycleEngine;
pub use history::{FunnelStep, TransitionLog};
pub use stage::{StageConfig, StageTable, StageTransition};
