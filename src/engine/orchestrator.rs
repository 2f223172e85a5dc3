use super::aggregator::Aggregator;
use super::dispatcher::{Dispatcher, ProviderTask};
use super::inflight::InflightRegistry;
use super::FetchResult;
use crate::cache::CacheStore;
use crate::config::Config;
use crate::download::PdfDownloader;
use crate::providers::{normalize_doi, normalize_query_key, PaperQuery, SourceProvider};
use crate::resilience::{
    BucketSnapshot, CircuitBreakerRegistry, CircuitSnapshot, RateLimiterRegistry, RetryConfig,
};
use crate::{Error, Result};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a deduplicated pipeline run resolves: a title sweep across every
/// provider, or a DOI lookup across the DOI-capable ones.
#[derive(Debug, Clone)]
enum PipelineQuery {
    Title(String),
    Doi(String),
}

impl PipelineQuery {
    /// Key the result is cached under. DOI results live under their own
    /// prefix so a title that happens to look like a DOI cannot collide.
    fn cache_key(&self) -> String {
        match self {
            Self::Title(title) => title.clone(),
            Self::Doi(doi) => format!("doi:{doi}"),
        }
    }

    /// Key concurrent callers join on.
    fn dedup_key(&self) -> String {
        match self {
            Self::Title(title) => normalize_query_key(title),
            Self::Doi(doi) => format!("doi:{doi}"),
        }
    }
}

/// Per-call options layered over the engine defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Also download the winning PDF to the configured directory
    pub download_local: bool,
    /// Bypass the cache for this call; the result is still written back
    pub skip_cache: bool,
}

/// Entry point of the engine: cache, dedup, dispatch, aggregate, persist.
///
/// Cheap to clone; every field is shared. A clone of the orchestrator is
/// moved into each deduplicated pipeline task, so the orchestrator must not
/// hold exclusive state of its own.
#[derive(Clone)]
pub struct Orchestrator {
    providers: Vec<Arc<dyn SourceProvider>>,
    dispatcher: Arc<Dispatcher>,
    aggregator: Arc<Aggregator>,
    cache: Arc<CacheStore>,
    inflight: Arc<InflightRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiterRegistry>,
    downloader: Arc<PdfDownloader>,
}

impl Orchestrator {
    /// Wire the engine together from configuration and a provider set.
    ///
    /// The secondary DOI resolver is the DOI-capable provider with the
    /// largest priority value. Providers ranked last are the specialized
    /// identifier resolvers, which is exactly what the post-search lookup
    /// needs; the higher-ranked ones already ran in the title dispatch.
    pub fn new(
        config: &Config,
        providers: Vec<Arc<dyn SourceProvider>>,
        cache: Arc<CacheStore>,
    ) -> Result<Self> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let limiter = Arc::new(RateLimiterRegistry::new(config.rate_limits.clone()));
        let retry = RetryConfig {
            retries: config.engine.retries,
            base_delay: config.engine.retry_base_delay(),
            ..RetryConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(
            breakers.clone(),
            limiter.clone(),
            retry,
            config.engine.max_concurrent,
        ));

        let doi_resolver = providers
            .iter()
            .filter(|p| p.supports_doi_lookup())
            .max_by_key(|p| p.priority())
            .cloned();
        let aggregator = Arc::new(Aggregator::new(doi_resolver));

        let downloader = Arc::new(PdfDownloader::new(
            config.download.directory.clone(),
            &config.identity.user_agent,
        )?);

        Ok(Self {
            providers,
            dispatcher,
            aggregator,
            cache,
            inflight: InflightRegistry::new(),
            breakers,
            limiter,
            downloader,
        })
    }

    /// Resolve a paper title to a PDF URL across all configured providers.
    #[instrument(skip(self), fields(title = %title))]
    pub async fn fetch_paper(&self, title: &str, options: FetchOptions) -> Result<FetchResult> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::InvalidInput {
                field: "title".to_string(),
                reason: "title must not be empty".to_string(),
            });
        }

        let query = PipelineQuery::Title(title.to_string());

        if !options.skip_cache {
            if let Some(hit) = self.cache.get(title).await? {
                info!(stale = hit.stale, "serving cached result");
                if hit.stale {
                    self.spawn_refresh(query.clone(), options);
                }
                return Ok(hit.entry.payload.into_cached(hit.stale));
            }
            if let Some(hit) = self.cache.get_negative(title).await? {
                debug!("serving cached negative result");
                return Ok(hit.entry.payload.into_cached(hit.stale));
            }
        }

        Ok(self.join_pipeline(query, options).await)
    }

    /// Resolve a bare DOI through the providers that support direct lookup.
    #[instrument(skip(self), fields(doi = %doi))]
    pub async fn fetch_by_doi(&self, doi: &str, options: FetchOptions) -> Result<FetchResult> {
        let doi = normalize_doi(doi);
        if doi.is_empty() {
            return Err(Error::InvalidInput {
                field: "doi".to_string(),
                reason: "doi must not be empty".to_string(),
            });
        }

        if !self.providers.iter().any(|p| p.supports_doi_lookup()) {
            return Err(Error::Config(
                "no provider supports DOI lookup".to_string(),
            ));
        }

        let query = PipelineQuery::Doi(doi);
        let cache_key = query.cache_key();

        if !options.skip_cache {
            if let Some(hit) = self.cache.get(&cache_key).await? {
                info!(stale = hit.stale, "serving cached doi result");
                if hit.stale {
                    self.spawn_refresh(query.clone(), options);
                }
                return Ok(hit.entry.payload.into_cached(hit.stale));
            }
            if let Some(hit) = self.cache.get_negative(&cache_key).await? {
                return Ok(hit.entry.payload.into_cached(hit.stale));
            }
        }

        Ok(self.join_pipeline(query, options).await)
    }

    /// Join an in-flight pipeline for this query, or start one.
    async fn join_pipeline(&self, query: PipelineQuery, options: FetchOptions) -> FetchResult {
        let key = query.dedup_key();
        let shared = self
            .inflight
            .join_or_insert(&key, || {
                self.clone().spawn_pipeline(key.clone(), query.clone(), options)
            })
            .await;
        shared.await
    }

    /// One full pipeline run as a shared, infallible future. The task removes
    /// its own in-flight entry before resolving so late joiners always attach
    /// while the work is genuinely pending.
    fn spawn_pipeline(
        self,
        key: String,
        query: PipelineQuery,
        options: FetchOptions,
    ) -> super::inflight::SharedFetch {
        let handle = tokio::spawn(async move {
            let result = self.run_pipeline(&query, options).await;
            self.inflight.remove(&key).await;
            result
        });
        handle
            .map(|joined| {
                joined.unwrap_or_else(|join_error| {
                    warn!(%join_error, "fetch pipeline aborted");
                    FetchResult::failure(
                        format!("fetch pipeline aborted: {join_error}"),
                        None,
                        None,
                        Vec::new(),
                        false,
                    )
                })
            })
            .boxed()
            .shared()
    }

    /// Dispatch the providers the query calls for, aggregate, optionally
    /// download, and write the result back to the cache. Never returns
    /// `Err`: every failure mode is absorbed into a failure `FetchResult`.
    async fn run_pipeline(&self, query: &PipelineQuery, options: FetchOptions) -> FetchResult {
        let tasks: Vec<ProviderTask> = match query {
            PipelineQuery::Title(title) => self
                .providers
                .iter()
                .map(|p| ProviderTask::new(p.clone(), PaperQuery::by_title(title.clone())))
                .collect(),
            PipelineQuery::Doi(doi) => self
                .providers
                .iter()
                .filter(|p| p.supports_doi_lookup())
                .map(|p| ProviderTask::new(p.clone(), PaperQuery::by_doi(doi)))
                .collect(),
        };

        let outcomes = self.dispatcher.dispatch(tasks).await;
        let mut result = self.aggregator.aggregate(outcomes, &self.dispatcher).await;
        if let PipelineQuery::Doi(doi) = query {
            if result.doi.is_none() {
                result.doi = Some(doi.clone());
            }
        }

        let cache_key = query.cache_key();
        if options.download_local {
            self.attach_local_copy(&mut result, &cache_key).await;
        }

        self.persist(&cache_key, &result).await;
        result
    }

    /// Best-effort local download. Failure degrades the result to URL-only
    /// rather than failing the fetch.
    async fn attach_local_copy(&self, result: &mut FetchResult, title: &str) {
        let Some(pdf_url) = result.pdf_url.clone() else {
            return;
        };
        match self.downloader.download(&pdf_url, title).await {
            Ok(path) => result.local_path = Some(path),
            Err(error) => {
                warn!(%error, url = %pdf_url, "local download failed, keeping url only");
            }
        }
    }

    /// Cache writes are best-effort; a cache fault never fails a fetch.
    async fn persist(&self, title: &str, result: &FetchResult) {
        let write = if result.success {
            self.cache.set(title, result).await
        } else {
            self.cache.set_negative(title, result).await
        };
        if let Err(error) = write {
            warn!(%error, "cache write failed");
        }
    }

    /// Fire-and-forget revalidation of a stale positive entry. The refresh
    /// set guarantees at most one refresh per key at a time; the guard is
    /// released even if the pipeline task panics upstream of it.
    fn spawn_refresh(&self, query: PipelineQuery, options: FetchOptions) {
        let this = self.clone();
        tokio::spawn(async move {
            let key = query.dedup_key();
            if !this.inflight.begin_refresh(&key).await {
                debug!(key, "refresh already running, skipping");
                return;
            }
            debug!(key, "background refresh started");
            let result = this.join_pipeline(query, options).await;
            debug!(key, success = result.success, "background refresh finished");
            this.inflight.end_refresh(&key).await;
        });
    }

    /// Current circuit breaker states, for operator introspection.
    pub async fn circuit_states(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshots().await
    }

    /// Current token bucket levels, for operator introspection.
    pub async fn bucket_levels(&self) -> Vec<BucketSnapshot> {
        self.limiter.snapshots().await
    }

    pub fn providers(&self) -> &[Arc<dyn SourceProvider>] {
        &self.providers
    }
}
