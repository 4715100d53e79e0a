//! Sync event stream for observability.
//!
//! Emits [`SyncEvent`]s on a [`tokio::sync::broadcast`] channel so observers
//! can follow job progress without coupling to the orchestrator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crm_types::ObjectType;

use crate::conflict::ConflictStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    JobStarted {
        job_id: Uuid,
        source: String,
        target: String,
        object_types: Vec<ObjectType>,
    },
    BatchCommitted {
        job_id: Uuid,
        object_type: ObjectType,
        batch: usize,
        offset: usize,
        records: usize,
    },
    RecordFailed {
        job_id: Uuid,
        object_type: ObjectType,
        record_id: String,
        error: String,
    },
    ConflictDetected {
        job_id: Uuid,
        conflict_id: Uuid,
        field: String,
        status: ConflictStatus,
    },
    JobCancelled {
        job_id: Uuid,
    },
    JobCompleted {
        job_id: Uuid,
        records_synced: usize,
        errors: usize,
        duration_ms: u64,
    },
    JobFailed {
        job_id: Uuid,
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<SyncEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Send to all current subscribers; dropped when there are none.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
