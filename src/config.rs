use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration, layered from embedded defaults, an optional TOML
/// file, and `PAPER_FETCHER_*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limits: RateLimitingConfig,
    pub identity: IdentityConfig,
    pub download: DownloadConfig,
}

/// Orchestration knobs: concurrency window, retries, per-call timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global cap on concurrently running provider calls
    pub max_concurrent: usize,
    /// Retries per provider call (attempts = retries + 1)
    pub retries: u32,
    /// Timeout applied inside each provider call
    pub provider_timeout_secs: u64,
    /// Base delay for exponential retry backoff
    pub retry_base_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            retries: 2,
            provider_timeout_secs: 10,
            retry_base_delay_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Which key-value backend the cache store writes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    /// Path for the sled backend; ignored by the in-memory backend
    pub path: Option<PathBuf>,
    /// TTL for positive results
    pub max_age_success_secs: u64,
    /// TTL for negative (not-found) results
    pub max_age_not_found_secs: u64,
    /// Window before expiry during which entries are served but flagged stale
    pub stale_while_revalidate_secs: u64,
    /// Entry-count bound; inserts past this evict the oldest 10% by write time
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            path: None,
            max_age_success_secs: 7 * 24 * 60 * 60,
            max_age_not_found_secs: 24 * 60 * 60,
            stale_while_revalidate_secs: 60 * 60,
            capacity: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn max_age_success(&self) -> Duration {
        Duration::from_secs(self.max_age_success_secs)
    }

    pub fn max_age_not_found(&self) -> Duration {
        Duration::from_secs(self.max_age_not_found_secs)
    }

    pub fn stale_while_revalidate(&self) -> Duration {
        Duration::from_secs(self.stale_while_revalidate_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening
    pub failure_threshold: u32,
    /// Successes in HalfOpen before closing
    pub success_threshold: u32,
    /// How long an opened circuit rejects calls before probing
    pub open_timeout_secs: u64,
    /// Quiet period after which the Closed failure count resets to zero
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_secs: 60,
            reset_timeout_secs: 300,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// Per-provider token bucket parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub requests_per_second: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Fixed table tuned to each external API's published or observed limits
    pub providers: HashMap<String, RateLimitEntry>,
    /// Conservative fallback for providers absent from the table
    pub default_limit: RateLimitEntry,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "arxiv".to_string(),
            RateLimitEntry {
                requests_per_second: 1.0,
                burst: 3,
            },
        );
        providers.insert(
            "semantic_scholar".to_string(),
            RateLimitEntry {
                requests_per_second: 1.0,
                burst: 1,
            },
        );
        providers.insert(
            "openalex".to_string(),
            RateLimitEntry {
                requests_per_second: 5.0,
                burst: 10,
            },
        );
        providers.insert(
            "crossref".to_string(),
            RateLimitEntry {
                requests_per_second: 2.0,
                burst: 5,
            },
        );
        providers.insert(
            "unpaywall".to_string(),
            RateLimitEntry {
                requests_per_second: 2.0,
                burst: 5,
            },
        );
        Self {
            providers,
            default_limit: RateLimitEntry {
                requests_per_second: 0.5,
                burst: 1,
            },
        }
    }
}

impl RateLimitingConfig {
    /// Bucket parameters for a provider, falling back to the default entry.
    pub fn limit_for(&self, provider: &str) -> RateLimitEntry {
        self.providers
            .get(provider)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Politeness identity sent to upstream APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub user_agent: String,
    /// Contact address required by CrossRef and Unpaywall etiquette
    pub contact_email: String,
    /// Optional Semantic Scholar key; lifts that API's harsh anonymous limits
    pub semantic_scholar_api_key: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("paper-fetcher/{}", env!("CARGO_PKG_VERSION")),
            contact_email: "contact@example.com".to_string(),
            semantic_scholar_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Directory that `download_local` writes PDFs into
    pub directory: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            directory: dirs::download_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("papers"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limits: RateLimitingConfig::default(),
            identity: IdentityConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file, and environment.
    pub fn load(config_file: Option<&std::path::Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PAPER_FETCHER")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Self = builder
            .build()
            .map_err(|e| Error::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent == 0 {
            return Err(Error::Config(
                "engine.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.success_threshold must be at least 1".to_string(),
            ));
        }
        if self.cache.stale_while_revalidate_secs >= self.cache.max_age_not_found_secs {
            return Err(Error::Config(
                "cache.stale_while_revalidate_secs must be smaller than every max age".to_string(),
            ));
        }
        if self.cache.backend == CacheBackendKind::Sled && self.cache.path.is_none() {
            return Err(Error::Config(
                "cache.path is required for the sled backend".to_string(),
            ));
        }
        for (name, entry) in &self.rate_limits.providers {
            if entry.requests_per_second <= 0.0 || entry.burst == 0 {
                return Err(Error::Config(format!(
                    "rate_limits.providers.{name} must have positive rate and burst"
                )));
            }
        }
        Ok(())
    }
}
