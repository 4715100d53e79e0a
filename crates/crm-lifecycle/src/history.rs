//! Bounded in-process log of recent transitions and the funnel view derived
//! from it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crm_types::LifecycleStage;

use crate::stage::StageTransition;

pub struct TransitionLog {
    capacity: usize,
    entries: Mutex<VecDeque<StageTransition>>,
}

/// Transitions observed between one pair of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStep {
    pub from: LifecycleStage,
    pub to: LifecycleStage,
    pub transitions: usize,
    /// Share of contacts that entered `from` (within the log) and then left
    /// it for `to`. `None` when no entries into `from` were logged.
    pub conversion_rate: Option<f64>,
}

impl TransitionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a transition, evicting the oldest when full.
    pub fn record(&self, transition: StageTransition) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(transition);
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<StageTransition> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Logged transitions into `stage`.
    pub fn entered(&self, stage: LifecycleStage) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.to_stage == stage)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Funnel steps in progression order.
    pub fn funnel(&self) -> Vec<FunnelStep> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pairs: BTreeMap<(LifecycleStage, LifecycleStage), usize> = BTreeMap::new();
        let mut entered: BTreeMap<LifecycleStage, usize> = BTreeMap::new();
        for t in entries.iter() {
            *pairs.entry((t.from_stage, t.to_stage)).or_default() += 1;
            *entered.entry(t.to_stage).or_default() += 1;
        }
        pairs
            .into_iter()
            .map(|((from, to), transitions)| FunnelStep {
                from,
                to,
                transitions,
                conversion_rate: entered
                    .get(&from)
                    .filter(|n| **n > 0)
                    .map(|n| transitions as f64 / *n as f64),
            })
            .collect()
    }
}
