//! Shared types, errors, clock and adapter interfaces for the CRM automation engines.
//!
//! This crate provides the foundational types used across the other crates:
//! - `CrmError` — unified error taxonomy
//! - `FieldValue` / `Record` — scalar field maps exchanged with CRM systems
//! - `LifecycleStage` — the ordered stage set contacts progress through
//! - `CrmAdapter` — capability set every external record system implements
//! - `Clock` — injectable time source

pub mod adapter;
pub mod clock;
pub mod enrichment;
pub mod stage;
pub mod value;

pub use adapter::CrmAdapter;
pub use clock::{Clock, FixedClock, SystemClock};
pub use enrichment::{EnrichmentProvider, EnrichmentResult};
pub use stage::{ContactRecord, LifecycleStage};
pub use value::{FieldMap, FieldValue, ObjectType, Record};

/// Unified error type for all CRM automation subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    // === Configuration ===
    #[error("Configuration error: {0}")]
    Configuration(String),

    // === Adapter Errors ===
    #[error("Transient fetch error from {system}: {message}")]
    TransientFetch { system: String, message: String },

    #[error("Transient upsert error on {system}: {message}")]
    TransientUpsert { system: String, message: String },

    #[error("{system} rejected the request: {message}")]
    PermanentAdapter { system: String, message: String },

    #[error("Operation '{operation}' not supported by {system}")]
    Unsupported { system: String, operation: String },

    // === Mapping / Conflict Errors ===
    #[error("No mapping for {object_type} field '{field}'")]
    UnmappedField { object_type: String, field: String },

    #[error("Conflict resolution error: {0}")]
    ConflictResolution(String),

    #[error("Conflict {id} is already resolved")]
    ConflictAlreadyResolved { id: String },

    // === Job Errors ===
    #[error("Sync job {job_id} cannot move from {from} to {to}")]
    InvalidJobTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Max retries exhausted for '{operation}' after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: usize },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CrmError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CrmError::TransientFetch { .. } | CrmError::TransientUpsert { .. }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrmError::Configuration(_)
                | CrmError::PermanentAdapter { .. }
                | CrmError::Unsupported { .. }
                | CrmError::UnmappedField { .. }
        )
    }

    /// Maps the error to an HTTP status code for a REST layer.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            CrmError::Configuration(_) | CrmError::ConflictResolution(_) => Some(400),
            CrmError::NotFound { .. } => Some(404),
            CrmError::ConflictAlreadyResolved { .. } | CrmError::InvalidJobTransition { .. } => {
                Some(409)
            }
            CrmError::UnmappedField { .. } => Some(422),
            CrmError::TransientFetch { .. } | CrmError::TransientUpsert { .. } => Some(503),
            CrmError::PermanentAdapter { .. } | CrmError::RetriesExhausted { .. } => Some(502),
            CrmError::Unsupported { .. } => Some(501),
            _ => None,
        }
    }

    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        CrmError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

/// A convenience alias for `Result<T, CrmError>`.
pub type Result<T> = std::result::Result<T, CrmError>;
