use crate::config::RateLimitingConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Per-provider token bucket: bursts up to `capacity`, steady-state refill
/// at `refill_per_second`. Refill is computed lazily at each acquire or
/// check, never on a timer.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst);
        Self {
            capacity,
            refill_per_second: requests_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        // `last_refill` sits in the future after a throttle; no tokens
        // accrue until the penalty elapses
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed > Duration::ZERO {
            self.tokens =
                (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take one token, or report how long to wait before retrying.
    fn try_acquire(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - self.tokens;
        let wait_ms = (deficit / self.refill_per_second * 1000.0).ceil() as u64;
        let future_gap = self
            .last_refill
            .saturating_duration_since(Instant::now());
        Err(future_gap + Duration::from_millis(wait_ms))
    }

    fn level(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Read-only bucket level for monitoring.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    pub provider: String,
    pub tokens: f64,
    pub capacity: f64,
    pub refill_per_second: f64,
}

/// Token bucket table keyed by provider name.
///
/// `acquire` never rejects, it only delays; waiters race for refilled
/// tokens, so ordering is best-effort rather than FIFO.
pub struct RateLimiterRegistry {
    config: RateLimitingConfig,
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimitingConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    async fn bucket(&self, provider: &str) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.read().await.get(provider) {
            return bucket.clone();
        }
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(provider.to_string())
            .or_insert_with(|| {
                let entry = self.config.limit_for(provider);
                debug!(
                    provider,
                    rate = entry.requests_per_second,
                    burst = entry.burst,
                    "creating token bucket"
                );
                Arc::new(Mutex::new(TokenBucket::new(
                    entry.requests_per_second,
                    entry.burst,
                )))
            })
            .clone()
    }

    /// Wait until a token is available for `provider`, then consume it.
    pub async fn acquire(&self, provider: &str) {
        let bucket = self.bucket(provider).await;
        loop {
            let wait = {
                let mut bucket = bucket.lock().await;
                match bucket.try_acquire() {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            debug!(provider, wait_ms = wait.as_millis() as u64, "rate limited");
            // Another acquirer may win the refilled token; loop and re-check
            sleep(wait).await;
        }
    }

    /// Whether a token is available right now, without consuming one.
    pub async fn check(&self, provider: &str) -> bool {
        let bucket = self.bucket(provider).await;
        let mut bucket = bucket.lock().await;
        bucket.level() >= 1.0
    }

    /// Apply an upstream-declared delay: drain the bucket and push the
    /// refill clock into the future so no token appears until `wait` passes.
    pub async fn throttle(&self, provider: &str, wait: Duration) {
        let bucket = self.bucket(provider).await;
        let mut bucket = bucket.lock().await;
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now() + wait;
        debug!(
            provider,
            wait_secs = wait.as_secs(),
            "throttled by upstream retry delay"
        );
    }

    /// Read-only levels of every instantiated bucket, for monitoring.
    pub async fn snapshots(&self) -> Vec<BucketSnapshot> {
        let buckets = self.buckets.read().await;
        let mut out = Vec::with_capacity(buckets.len());
        for (provider, bucket) in buckets.iter() {
            let mut bucket = bucket.lock().await;
            out.push(BucketSnapshot {
                provider: provider.clone(),
                tokens: bucket.level(),
                capacity: bucket.capacity,
                refill_per_second: bucket.refill_per_second,
            });
        }
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}
