pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use rate_limiter::{BucketSnapshot, RateLimiterRegistry};
pub use retry::{with_retry, RetryConfig};
