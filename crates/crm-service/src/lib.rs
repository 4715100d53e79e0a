//! Service layer over the lifecycle and sync engines: the operations a REST
//! front end exposes, plus settings and enrichment.

pub mod api;
pub mod enrichment;
pub mod mappings;
pub mod service;
pub mod settings;

pub use api::{
    ConfigureMapping, ConflictResolved, EnrichedContact, EvaluationResult, FunnelReport,
    JobDescriptor, LifecycleEvaluation, MappingConfigured, ResolveConflict, StageDefinition,
    StageSummary, SubmitSyncJob,
};
pub use enrichment::{merge_absent, DirectoryEnrichment};
pub use mappings::MappingRegistry;
pub use service::{CrmService, ScheduledSync};
pub use settings::Settings;
