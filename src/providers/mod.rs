pub mod arxiv;
pub mod crossref;
pub mod openalex;
pub mod semantic_scholar;
pub mod unpaywall;

pub use arxiv::ArxivProvider;
pub use crossref::CrossRefProvider;
pub use openalex::OpenAlexProvider;
pub use semantic_scholar::SemanticScholarProvider;
pub use unpaywall::UnpaywallProvider;

use crate::config::Config;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// Query handed to every provider fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperQuery {
    /// Paper title, when resolving by title
    pub title: Option<String>,
    /// Normalized DOI, when resolving by identifier
    pub doi: Option<String>,
}

impl PaperQuery {
    pub fn by_title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            doi: None,
        }
    }

    pub fn by_doi(doi: &str) -> Self {
        Self {
            title: None,
            doi: Some(normalize_doi(doi)),
        }
    }
}

/// Bibliographic metadata carried alongside provider outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperMetadata {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub journal: Option<String>,
    pub year: Option<u32>,
    pub doi: Option<String>,
    pub abstract_text: Option<String>,
}

/// Outcome of a single provider invocation.
///
/// `Found` always carries a non-empty PDF URL; fetchers that located the
/// paper but not a full text return `NotFound` with whatever DOI/metadata
/// they did recover, so the aggregator can attempt a secondary lookup.
#[derive(Debug, Clone)]
pub enum ProviderOutcome {
    Found {
        pdf_url: String,
        metadata: PaperMetadata,
    },
    NotFound {
        reason: String,
        doi: Option<String>,
        metadata: Option<PaperMetadata>,
    },
    Failed(crate::Error),
}

impl ProviderOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found { .. })
    }

    /// DOI attached to a non-found outcome, if any.
    pub fn discovered_doi(&self) -> Option<&str> {
        match self {
            Self::NotFound { doi, .. } => doi.as_deref(),
            _ => None,
        }
    }
}

/// An external data source capable of resolving a paper query to a PDF link.
///
/// Implementations own their transport details (HTTP, parsing, per-call
/// timeouts); the engine only sees structured outcomes. A fetcher returning
/// `Err` is classified and treated the same as `ProviderOutcome::Failed`.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Unique provider name, also the circuit breaker and bucket key
    fn name(&self) -> &str;

    /// Tie-break rank among simultaneous successes; lower wins
    fn priority(&self) -> u8;

    /// Whether this provider can resolve a bare DOI
    fn supports_doi_lookup(&self) -> bool {
        false
    }

    async fn invoke(&self, query: &PaperQuery) -> Result<ProviderOutcome>;
}

/// The standard fetcher set in priority order, built from configuration.
pub fn default_providers(config: &Config) -> Result<Vec<Arc<dyn SourceProvider>>> {
    let user_agent = &config.identity.user_agent;
    let email = &config.identity.contact_email;
    let timeout = config.engine.provider_timeout();
    Ok(vec![
        Arc::new(ArxivProvider::new(user_agent, timeout)?),
        Arc::new(SemanticScholarProvider::new(
            user_agent,
            config.identity.semantic_scholar_api_key.clone(),
            timeout,
        )?),
        Arc::new(OpenAlexProvider::new(user_agent, email, timeout)?),
        Arc::new(CrossRefProvider::new(user_agent, email, timeout)?),
        Arc::new(UnpaywallProvider::new(user_agent, email, timeout)?),
    ])
}

/// Normalize a DOI: strip resolver prefixes, trim, lowercase.
pub fn normalize_doi(doi: &str) -> String {
    doi.trim()
        .trim_start_matches("https://doi.org/")
        .trim_start_matches("http://doi.org/")
        .to_lowercase()
}

/// Normalize a title into a deterministic cache/dedup key: lowercase,
/// trimmed, inner whitespace collapsed. Case and spacing variants of the
/// same title collide intentionally.
pub fn normalize_query_key(title: &str) -> String {
    let collapsed = whitespace_re().replace_all(title.trim(), " ");
    collapsed.to_lowercase()
}

/// Strip punctuation and collapse whitespace for similarity comparison.
fn normalize_title(title: &str) -> String {
    let stripped = punctuation_re().replace_all(title, " ");
    whitespace_re()
        .replace_all(&stripped, " ")
        .trim()
        .to_lowercase()
}

/// Word-set Jaccard similarity between two titles, ignoring short words.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let words = |t: &str| -> std::collections::HashSet<String> {
        normalize_title(t)
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .map(str::to_string)
            .collect()
    };
    let set_a = words(a);
    let set_b = words(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

/// Whether a search hit is close enough to the requested title to accept.
pub fn is_title_match(search_title: &str, result_title: &str) -> bool {
    title_similarity(search_title, result_title) >= 0.5
}

fn whitespace_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\s+").unwrap())
}

fn punctuation_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"[^\w\s]").unwrap())
}
