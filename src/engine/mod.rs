pub mod aggregator;
pub mod dispatcher;
pub mod inflight;
pub mod orchestrator;

pub use aggregator::Aggregator;
pub use dispatcher::{DispatchOutcome, Dispatcher, ProviderTask};
pub use inflight::InflightRegistry;
pub use orchestrator::{FetchOptions, Orchestrator};

use crate::providers::PaperMetadata;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Caller-visible output of a fetch: either the success fields or the
/// failure fields are populated, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResult {
    pub success: bool,
    pub pdf_url: Option<String>,
    pub local_path: Option<PathBuf>,
    pub source: Option<String>,
    pub metadata: Option<PaperMetadata>,
    /// Error message when the fetch failed
    pub error: Option<String>,
    /// DOI discovered along the way; lets the caller retry via a narrower path
    pub doi: Option<String>,
    /// Whether any DOI or metadata was recovered despite the failure
    pub partial: bool,
    /// Providers consulted, in task order
    pub sources_attempted: Vec<String>,
    /// Whether this response was served from cache
    #[serde(default)]
    pub cached: bool,
    /// Whether the served cache entry was past its stale boundary
    #[serde(default)]
    pub stale: bool,
}

impl FetchResult {
    pub fn found(pdf_url: String, source: String, metadata: Option<PaperMetadata>) -> Self {
        Self {
            success: true,
            pdf_url: Some(pdf_url),
            source: Some(source),
            metadata,
            ..Self::default()
        }
    }

    pub fn failure(
        error: String,
        doi: Option<String>,
        metadata: Option<PaperMetadata>,
        sources_attempted: Vec<String>,
        partial: bool,
    ) -> Self {
        Self {
            success: false,
            error: Some(error),
            doi,
            metadata,
            partial,
            sources_attempted,
            ..Self::default()
        }
    }

    /// Mark a result as served from cache, carrying the staleness flag.
    pub fn into_cached(mut self, stale: bool) -> Self {
        self.cached = true;
        self.stale = stale;
        self
    }
}
