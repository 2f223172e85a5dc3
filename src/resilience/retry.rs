use crate::error::ErrorCategory;
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration for a single provider call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = retries + 1)
    pub retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Hard cap on any computed backoff delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Execute `operation` with bounded retries.
///
/// Each failure is already classified (the operation returns [`crate::Error`]);
/// non-retryable errors rethrow immediately without consuming remaining
/// attempts. Retryable failures back off exponentially with jitter, except
/// rate-limited ones, which wait the upstream-declared delay verbatim.
/// Exhausting retries rethrows the last error; recording it against the
/// circuit breaker is the caller's job.
pub async fn with_retry<T, F, Fut>(operation: F, config: &RetryConfig, provider: &str) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(provider, attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retryable() {
                    debug!(provider, %error, "non-retryable error, not retrying");
                    return Err(error);
                }
                if attempt >= config.retries {
                    warn!(provider, attempts = attempt + 1, %error, "retries exhausted");
                    return Err(error);
                }

                let delay = match error.category() {
                    ErrorCategory::RateLimited => error
                        .retry_after()
                        .unwrap_or(config.max_delay),
                    _ => backoff_delay(attempt, config),
                };
                debug!(provider, attempt, delay_ms = delay.as_millis() as u64, %error, "retrying");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// `min(max_delay, base * 2^attempt * jitter)` with jitter in `[0.5, 1.5)`.
fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    use rand::Rng;
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    let base_ms = config.base_delay.as_millis() as f64;
    let delay_ms = base_ms * 2f64.powi(attempt as i32) * jitter;
    Duration::from_millis(delay_ms as u64).min(config.max_delay)
}
