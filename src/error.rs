use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for the fetch orchestration engine.
///
/// Every provider failure is classified into one of these variants so that
/// the retry executor and circuit breakers can branch exhaustively on
/// [`ErrorCategory`] instead of string matching.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Configuration errors (permanent failures)
    #[error("Configuration error: {0}")]
    Config(String),

    // Network errors (transient - should retry)
    #[error("Network timeout after {timeout:?}: {provider}")]
    NetworkTimeout { provider: String, timeout: Duration },

    #[error("Connection failed for {provider}: {message}")]
    ConnectionFailed { provider: String, message: String },

    #[error("DNS resolution failed: {hostname}")]
    DnsFailure { hostname: String },

    // Upstream HTTP status errors
    #[error("HTTP {status} from {provider}: {message}")]
    HttpStatus {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Rate limit exceeded for {provider}: retry after {retry_after:?}")]
    RateLimitExceeded {
        provider: String,
        retry_after: Duration,
    },

    // Client errors (permanent - don't retry)
    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Parse error in {context}: {message}")]
    Parse { context: String, message: String },

    // Circuit breaker rejection - synthetic, no network attempt was made
    #[error("Circuit breaker open for provider: {provider}")]
    CircuitOpen { provider: String },

    // Cache errors
    #[error("Cache error: {operation} failed - {reason}")]
    Cache { operation: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic provider failure
    #[error("Provider {provider} error: {message}")]
    Provider { provider: String, message: String },
}

/// Error categorization driving retry and circuit breaker decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Permanent errors - retrying cannot help
    Permanent,
    /// Transient errors - safe to retry with backoff
    Transient,
    /// Upstream asked us to back off for a declared delay
    RateLimited,
    /// Circuit breaker rejected the call before any network attempt
    CircuitOpen,
}

impl Error {
    /// Categorize this error for retry and breaker logic.
    ///
    /// Unclassifiable failures land in `Transient`: assuming permanence on an
    /// unknown error risks discarding a recoverable provider.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_)
            | Self::InvalidInput { .. }
            | Self::Parse { .. }
            | Self::Serialization(_) => ErrorCategory::Permanent,

            Self::RateLimitExceeded { .. } => ErrorCategory::RateLimited,

            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,

            Self::HttpStatus { status, .. } => match *status {
                429 => ErrorCategory::RateLimited,
                400..=499 => ErrorCategory::Permanent,
                _ => ErrorCategory::Transient,
            },

            Self::NetworkTimeout { .. }
            | Self::ConnectionFailed { .. }
            | Self::DnsFailure { .. }
            | Self::Cache { .. }
            | Self::Provider { .. } => ErrorCategory::Transient,
        }
    }

    /// Whether the retry executor may attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::RateLimited
        )
    }

    /// Upstream-declared retry delay, if any (e.g. a `Retry-After` header).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Name of the provider this error was observed against, if known.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::NetworkTimeout { provider, .. }
            | Self::ConnectionFailed { provider, .. }
            | Self::HttpStatus { provider, .. }
            | Self::RateLimitExceeded { provider, .. }
            | Self::CircuitOpen { provider }
            | Self::Provider { provider, .. } => Some(provider),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classify a `reqwest` transport failure against a provider.
pub fn classify_reqwest(err: &reqwest::Error, provider: &str) -> Error {
    if err.is_timeout() {
        return Error::NetworkTimeout {
            provider: provider.to_string(),
            timeout: Duration::from_secs(10),
        };
    }
    if err.is_connect() {
        return Error::ConnectionFailed {
            provider: provider.to_string(),
            message: err.to_string(),
        };
    }
    if let Some(status) = err.status() {
        return classify_status(status.as_u16(), None, provider, &err.to_string());
    }
    Error::Provider {
        provider: provider.to_string(),
        message: err.to_string(),
    }
}

/// Classify an HTTP status code, honoring a `Retry-After` header on 429.
///
/// The header value may be a delay in seconds or an HTTP-date; the date form
/// converts to a non-negative millisecond delta from now.
pub fn classify_status(
    status: u16,
    retry_after_header: Option<&str>,
    provider: &str,
    message: &str,
) -> Error {
    match status {
        429 => Error::RateLimitExceeded {
            provider: provider.to_string(),
            retry_after: retry_after_header
                .and_then(parse_retry_after)
                .unwrap_or(Duration::from_secs(60)),
        },
        _ => Error::HttpStatus {
            provider: provider.to_string(),
            status,
            message: message.to_string(),
        },
    }
}

/// Parse a `Retry-After` header value: either delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta_ms = date
        .signed_duration_since(chrono::Utc::now())
        .num_milliseconds();
    // A date in the past means the wait is already over
    Some(Duration::from_millis(delta_ms.max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_429_is_rate_limited() {
        let err = classify_status(429, Some("7"), "arxiv", "too many requests");
        assert_eq!(err.category(), ErrorCategory::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_status_4xx_is_permanent() {
        for status in [400, 403, 404, 422] {
            let err = classify_status(status, None, "crossref", "client error");
            assert_eq!(err.category(), ErrorCategory::Permanent);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_status_5xx_is_transient() {
        for status in [500, 502, 503] {
            let err = classify_status(status, None, "unpaywall", "server error");
            assert_eq!(err.category(), ErrorCategory::Transient);
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = Error::NetworkTimeout {
            provider: "arxiv".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_unknown_provider_error_fails_open_toward_retry() {
        let err = Error::Provider {
            provider: "arxiv".to_string(),
            message: "something odd".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_circuit_open_is_not_retryable() {
        let err = Error::CircuitOpen {
            provider: "arxiv".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::CircuitOpen);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retry_after_seconds_form() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_retry_after_http_date_in_past_clamps_to_zero() {
        let past = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(parse_retry_after(past), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_http_date_in_future() {
        let future = (chrono::Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!(parsed > Duration::from_secs(85));
        assert!(parsed < Duration::from_secs(95));
    }

    #[test]
    fn test_retry_after_garbage() {
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_missing_retry_after_uses_default() {
        let err = classify_status(429, None, "arxiv", "slow down");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    }
}
