use crate::config::CircuitBreakerConfig;
use crate::error::{Error, ErrorCategory};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected immediately without a network attempt
    Open,
    /// Limited probe requests allowed to test recovery
    HalfOpen,
}

/// Mutable per-provider breaker bookkeeping.
///
/// `open_timeout_override` applies to the current open cycle only: a
/// rate-limited failure extends the cooldown to at least the upstream's
/// declared delay, and the override is discarded when the cycle ends.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// Probe calls admitted and not yet settled in the current HalfOpen cycle
    half_open_probes: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    open_timeout_override: Option<Duration>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_probes: 0,
            last_failure_at: None,
            opened_at: None,
            open_timeout_override: None,
        }
    }

    fn open(&mut self, timeout_override: Option<Duration>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.open_timeout_override = timeout_override;
        self.half_open_successes = 0;
        self.half_open_probes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.half_open_probes = 0;
        self.opened_at = None;
        self.open_timeout_override = None;
    }
}

/// Read-only breaker snapshot for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub seconds_since_last_failure: Option<u64>,
}

/// One circuit breaker per provider name, created lazily on first access.
///
/// All state transitions are evaluated lazily on access; there is no
/// background timer.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<Mutex<BreakerInner>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    async fn breaker(&self, provider: &str) -> Arc<Mutex<BreakerInner>> {
        if let Some(breaker) = self.breakers.read().await.get(provider) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                debug!(provider, "creating circuit breaker");
                Arc::new(Mutex::new(BreakerInner::new()))
            })
            .clone()
    }

    /// Check whether a call to `provider` may proceed.
    ///
    /// Must be called before every attempt: it also performs the time-based
    /// Open -> HalfOpen transition and the quiet-period failure-count reset.
    pub async fn is_allowed(&self, provider: &str) -> bool {
        let breaker = self.breaker(provider).await;
        let mut inner = breaker.lock().await;

        match inner.state {
            CircuitState::Closed => {
                // A long quiet period forgives accumulated failures
                if let Some(last) = inner.last_failure_at {
                    if last.elapsed() > self.config.reset_timeout() && inner.consecutive_failures > 0
                    {
                        debug!(provider, "failure count reset after quiet period");
                        inner.consecutive_failures = 0;
                    }
                }
                true
            }
            CircuitState::Open => {
                let timeout = inner
                    .open_timeout_override
                    .map_or(self.config.open_timeout(), |o| {
                        o.max(self.config.open_timeout())
                    });
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |at| at.elapsed());
                if elapsed >= timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    // The transitioning call is itself the first probe
                    inner.half_open_probes = 1;
                    inner.open_timeout_override = None;
                    info!(provider, "circuit transitioning Open -> HalfOpen");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // Admit at most success_threshold unsettled probes at a time
                if inner.half_open_probes < self.config.success_threshold {
                    inner.half_open_probes += 1;
                    true
                } else {
                    debug!(provider, "half-open probe budget exhausted");
                    false
                }
            }
        }
    }

    /// Record a successful call against `provider`.
    pub async fn record_success(&self, provider: &str) {
        let breaker = self.breaker(provider).await;
        let mut inner = breaker.lock().await;

        match inner.state {
            CircuitState::Closed => {
                // Rolling recovery signal, not a full reset
                inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.close();
                    info!(provider, "circuit transitioning HalfOpen -> Closed");
                }
            }
            CircuitState::Open => {
                // A success while open means a call raced the transition;
                // treat it as a recovery probe
                inner.close();
                info!(provider, "circuit closed after success while open");
            }
        }
    }

    /// Record a failed call against `provider`.
    ///
    /// Rate-limited failures open the circuit immediately, with the open
    /// cooldown extended to at least the upstream-declared delay for this
    /// cycle only.
    pub async fn record_failure(&self, provider: &str, error: &Error) {
        // Circuit-open rejections never reach the network and must not
        // feed back into the breaker
        if error.category() == ErrorCategory::CircuitOpen {
            return;
        }

        let breaker = self.breaker(provider).await;
        let mut inner = breaker.lock().await;

        if error.category() == ErrorCategory::RateLimited {
            let override_timeout = error.retry_after();
            inner.open(override_timeout);
            inner.last_failure_at = Some(Instant::now());
            warn!(
                provider,
                retry_after = ?override_timeout,
                "circuit opened immediately on rate limit"
            );
            return;
        }

        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    inner.open(None);
                    warn!(provider, failures, "circuit opened on failure threshold");
                }
            }
            CircuitState::HalfOpen => {
                inner.open(None);
                warn!(provider, "circuit reopened on half-open failure");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state for a provider without mutating anything.
    pub async fn state(&self, provider: &str) -> CircuitState {
        let breaker = self.breaker(provider).await;
        let inner = breaker.lock().await;
        inner.state
    }

    /// Read-only snapshots of every breaker, for monitoring.
    pub async fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers = self.breakers.read().await;
        let mut out = Vec::with_capacity(breakers.len());
        for (provider, breaker) in breakers.iter() {
            let inner = breaker.lock().await;
            out.push(CircuitSnapshot {
                provider: provider.clone(),
                state: inner.state,
                consecutive_failures: inner.consecutive_failures,
                half_open_successes: inner.half_open_successes,
                seconds_since_last_failure: inner.last_failure_at.map(|at| at.elapsed().as_secs()),
            });
        }
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}
