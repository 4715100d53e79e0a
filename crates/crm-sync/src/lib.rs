//! Synchronization engine: moves records from a source CRM to a target CRM
//! through a field mapping, reconciling conflicting values on the way.

pub mod adapters;
pub mod conflict;
pub mod events;
pub mod job;
pub mod mapper;
pub mod orchestrator;
pub mod retry;
pub mod store;

pub use adapters::{AdapterRegistry, MemoryAdapter, Snapshot, SystemKind};
pub use conflict::{
    detect, resolve, ConflictRecord, ConflictStatus, ConflictStrategy, FieldConflict, Resolution,
};
pub use events::{EventEmitter, SyncEvent};
pub use job::{
    default_match_field, JobStatus, ObjectCursor, RecordError, RecordOutcome, SyncJob,
    SyncJobSpec,
};
pub use mapper::{FieldMapper, FieldMapping, MappingSet};
pub use orchestrator::{SyncConfig, SyncOrchestrator};
pub use retry::{retry_transient, BackoffPolicy};
pub use store::{
    ConflictQuery, ConflictStore, FileJobStore, JobStore, MemoryConflictStore, MemoryJobStore,
};
pub use tokio_util::sync::CancellationToken;
