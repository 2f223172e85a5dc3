pub mod cache;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod providers;
pub mod resilience;

pub use cache::{CacheEntry, CacheLookup, CacheStore, InMemoryBackend, SledBackend};
pub use config::Config;
pub use download::PdfDownloader;
pub use engine::{FetchOptions, FetchResult, Orchestrator};
pub use error::{Error, ErrorCategory, Result};
pub use providers::{
    default_providers, ArxivProvider, CrossRefProvider, OpenAlexProvider, PaperMetadata,
    PaperQuery, ProviderOutcome, SemanticScholarProvider, SourceProvider, UnpaywallProvider,
};
pub use resilience::{CircuitBreakerRegistry, CircuitState, RateLimiterRegistry, RetryConfig};
