//! Enrichment provider interface. Providers feed extra fields into contact
//! field maps before lifecycle evaluation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::value::FieldMap;

/// Outcome of a single enrichment lookup. Failures are reported in-band so
/// callers can keep going without the extra data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub success: bool,
    #[serde(default)]
    pub fields: FieldMap,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnrichmentResult {
    pub fn found(source: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            success: true,
            fields,
            source: source.into(),
            error: None,
        }
    }

    pub fn failed(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            fields: FieldMap::new(),
            source: source.into(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Look up data for an identifier (an email address or a company domain).
    async fn enrich(&self, identifier: &str) -> EnrichmentResult;
}
