use crate::error::ErrorCategory;
use crate::providers::{PaperQuery, ProviderOutcome, SourceProvider};
use crate::resilience::{with_retry, CircuitBreakerRegistry, RateLimiterRegistry, RetryConfig};
use crate::Error;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// One unit of dispatch: a provider plus the query to run against it.
pub struct ProviderTask {
    pub provider: Arc<dyn SourceProvider>,
    pub query: PaperQuery,
}

impl ProviderTask {
    pub fn new(provider: Arc<dyn SourceProvider>, query: PaperQuery) -> Self {
        Self { provider, query }
    }
}

/// A settled task, tagged with its provider identity and original position.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub provider: String,
    pub priority: u8,
    pub outcome: ProviderOutcome,
}

/// Bounded worker pool over provider tasks.
///
/// Tasks run concurrently up to `max_concurrent`; completion order is
/// unconstrained but the returned outcome list preserves input order. No
/// task is ever cancelled once started: slower providers run to completion
/// so breaker and bucket bookkeeping stays consistent.
pub struct Dispatcher {
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiterRegistry>,
    retry: RetryConfig,
    max_concurrent: usize,
}

impl Dispatcher {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        limiter: Arc<RateLimiterRegistry>,
        retry: RetryConfig,
        max_concurrent: usize,
    ) -> Self {
        Self {
            breakers,
            limiter,
            retry,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Run every task and return one outcome per task, in input order.
    pub async fn dispatch(&self, tasks: Vec<ProviderTask>) -> Vec<DispatchOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        // Pre-sort by priority so higher-priority providers grab scarce
        // slots first; a scheduling hint, not a correctness requirement
        let mut indexed: Vec<(usize, ProviderTask)> = tasks.into_iter().enumerate().collect();
        indexed.sort_by_key(|(_, task)| task.provider.priority());

        let mut handles = Vec::with_capacity(indexed.len());
        for (index, task) in indexed {
            let semaphore = semaphore.clone();
            let breakers = self.breakers.clone();
            let limiter = self.limiter.clone();
            let retry = self.retry.clone();
            let name = task.provider.name().to_string();
            let priority = task.provider.priority();

            let handle = tokio::spawn({
                let name = name.clone();
                async move {
                    // Fast-fail before consuming a slot or a token
                    if !breakers.is_allowed(&name).await {
                        debug!(provider = %name, "skipping provider, circuit open");
                        return (
                            index,
                            DispatchOutcome {
                                provider: name.clone(),
                                priority,
                                outcome: ProviderOutcome::Failed(Error::CircuitOpen {
                                    provider: name,
                                }),
                            },
                        );
                    }

                    // The semaphore is never closed, so acquisition cannot fail
                    let permit = semaphore.acquire_owned().await.ok();
                    let outcome = Self::run_task(&task, &breakers, &limiter, &retry).await;
                    drop(permit);

                    (
                        index,
                        DispatchOutcome {
                            provider: name,
                            priority,
                            outcome,
                        },
                    )
                }
            });
            handles.push((index, name, priority, handle));
        }

        let mut settled = Vec::with_capacity(handles.len());
        for (index, name, priority, handle) in handles {
            match handle.await {
                Ok(pair) => settled.push(pair),
                Err(join_error) => {
                    // A panicked task still owes the caller an outcome;
                    // settle its slot with a failure instead of dropping it
                    warn!(provider = %name, %join_error, "dispatched task aborted");
                    settled.push((
                        index,
                        DispatchOutcome {
                            provider: name.clone(),
                            priority,
                            outcome: ProviderOutcome::Failed(Error::Provider {
                                provider: name,
                                message: format!("task aborted: {join_error}"),
                            }),
                        },
                    ));
                }
            }
        }
        settled.sort_by_key(|(index, _)| *index);
        settled.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Rate limiter -> retry executor -> provider call, with every terminal
    /// result reported back to the circuit breaker.
    async fn run_task(
        task: &ProviderTask,
        breakers: &CircuitBreakerRegistry,
        limiter: &RateLimiterRegistry,
        retry: &RetryConfig,
    ) -> ProviderOutcome {
        let name = task.provider.name();
        limiter.acquire(name).await;

        let provider = task.provider.clone();
        let query = task.query.clone();
        let result = with_retry(
            || {
                let provider = provider.clone();
                let query = query.clone();
                async move { provider.invoke(&query).await }
            },
            retry,
            name,
        )
        .await;

        match result {
            Ok(outcome) => {
                breakers.record_success(name).await;
                outcome
            }
            Err(error) => {
                breakers.record_failure(name, &error).await;
                if error.category() == ErrorCategory::RateLimited {
                    if let Some(wait) = error.retry_after() {
                        limiter.throttle(name, wait).await;
                    }
                }
                debug!(provider = %name, %error, "provider call failed");
                ProviderOutcome::Failed(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, RateLimitingConfig};
    use crate::providers::PaperMetadata;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct ScriptedProvider {
        name: String,
        priority: u8,
        delay: Duration,
        outcome: fn() -> crate::Result<ProviderOutcome>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(
            name: &str,
            priority: u8,
            outcome: fn() -> crate::Result<ProviderOutcome>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                priority,
                delay: Duration::ZERO,
                outcome,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl SourceProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        async fn invoke(&self, _query: &PaperQuery) -> crate::Result<ProviderOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.outcome)()
        }
    }

    fn found() -> crate::Result<ProviderOutcome> {
        Ok(ProviderOutcome::Found {
            pdf_url: "https://example.org/paper.pdf".to_string(),
            metadata: PaperMetadata::default(),
        })
    }

    fn not_found() -> crate::Result<ProviderOutcome> {
        Ok(ProviderOutcome::NotFound {
            reason: "no hit".to_string(),
            doi: None,
            metadata: None,
        })
    }

    fn server_error() -> crate::Result<ProviderOutcome> {
        Err(Error::HttpStatus {
            provider: "scripted".to_string(),
            status: 500,
            message: "boom".to_string(),
        })
    }

    fn dispatcher() -> Dispatcher {
        dispatcher_with_breakers(Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
        )))
    }

    fn dispatcher_with_breakers(breakers: Arc<CircuitBreakerRegistry>) -> Dispatcher {
        // Generous bucket defaults so rate limiting does not interfere
        let mut limits = RateLimitingConfig::default();
        limits.default_limit.requests_per_second = 1000.0;
        limits.default_limit.burst = 1000;
        Dispatcher::new(
            breakers,
            Arc::new(RateLimiterRegistry::new(limits)),
            RetryConfig {
                retries: 0,
                base_delay: Duration::from_millis(1),
                ..RetryConfig::default()
            },
            4,
        )
    }

    fn task(provider: &Arc<ScriptedProvider>) -> ProviderTask {
        ProviderTask::new(provider.clone(), PaperQuery::by_title("test paper"))
    }

    #[tokio::test]
    async fn test_outcomes_preserve_input_order() {
        let slow = ScriptedProvider::new("slow", 5, found);
        let fast = ScriptedProvider::new("fast", 1, not_found);

        let d = dispatcher();
        let outcomes = d.dispatch(vec![task(&slow), task(&fast)]).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].provider, "slow");
        assert_eq!(outcomes[1].provider, "fast");
    }

    #[tokio::test]
    async fn test_circuit_open_task_skipped_without_invocation() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        breakers
            .record_failure(
                "down",
                &Error::HttpStatus {
                    provider: "down".to_string(),
                    status: 503,
                    message: "unavailable".to_string(),
                },
            )
            .await;

        let provider = ScriptedProvider::new("down", 1, found);
        let d = dispatcher_with_breakers(breakers);
        let outcomes = d.dispatch(vec![task(&provider)]).await;

        assert!(matches!(
            &outcomes[0].outcome,
            ProviderOutcome::Failed(Error::CircuitOpen { .. })
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_are_converted_to_outcomes() {
        let provider = ScriptedProvider::new("flaky", 1, server_error);
        let d = dispatcher();
        let outcomes = d.dispatch(vec![task(&provider)]).await;

        assert!(matches!(
            &outcomes[0].outcome,
            ProviderOutcome::Failed(Error::HttpStatus { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_panicked_task_settles_as_failed_outcome() {
        struct PanickingProvider;

        #[async_trait]
        impl SourceProvider for PanickingProvider {
            fn name(&self) -> &str {
                "unstable"
            }
            fn priority(&self) -> u8 {
                2
            }
            async fn invoke(&self, _query: &PaperQuery) -> crate::Result<ProviderOutcome> {
                panic!("provider blew up");
            }
        }

        let steady = ScriptedProvider::new("steady", 1, found);
        let d = dispatcher();
        let outcomes = d
            .dispatch(vec![
                ProviderTask::new(Arc::new(PanickingProvider), PaperQuery::by_title("test")),
                task(&steady),
            ])
            .await;

        // One outcome per task, in input order, even for the aborted one
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].provider, "unstable");
        assert!(matches!(
            &outcomes[0].outcome,
            ProviderOutcome::Failed(Error::Provider { .. })
        ));
        assert!(outcomes[1].outcome.is_found());
    }

    #[tokio::test]
    async fn test_failure_feeds_circuit_breaker() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        let provider = ScriptedProvider::new("flaky", 1, server_error);
        let d = dispatcher_with_breakers(breakers.clone());

        let _ = d.dispatch(vec![task(&provider)]).await;
        assert_eq!(
            breakers.state("flaky").await,
            crate::resilience::CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_concurrency_cap_respected() {
        use std::sync::atomic::AtomicI32;

        static IN_FLIGHT: AtomicI32 = AtomicI32::new(0);
        static PEAK: AtomicI32 = AtomicI32::new(0);

        struct GaugeProvider {
            name: String,
        }

        #[async_trait]
        impl SourceProvider for GaugeProvider {
            fn name(&self) -> &str {
                &self.name
            }
            fn priority(&self) -> u8 {
                1
            }
            async fn invoke(&self, _query: &PaperQuery) -> crate::Result<ProviderOutcome> {
                let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
                PEAK.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
                Ok(ProviderOutcome::NotFound {
                    reason: "none".to_string(),
                    doi: None,
                    metadata: None,
                })
            }
        }

        let mut limits = RateLimitingConfig::default();
        limits.default_limit.requests_per_second = 1000.0;
        limits.default_limit.burst = 1000;
        let d = Dispatcher::new(
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(RateLimiterRegistry::new(limits)),
            RetryConfig::default(),
            2,
        );

        let tasks: Vec<ProviderTask> = (0..6)
            .map(|i| {
                ProviderTask::new(
                    Arc::new(GaugeProvider {
                        name: format!("p{i}"),
                    }),
                    PaperQuery::by_title("test"),
                )
            })
            .collect();

        let outcomes = d.dispatch(tasks).await;
        assert_eq!(outcomes.len(), 6);
        assert!(PEAK.load(Ordering::SeqCst) <= 2);
    }
}
