//! Error types for the Turnstile admission layer.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::Dimension;

/// Boxed error produced by a unit of work or a fallback.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for Turnstile operations.
///
/// No variant is fatal to the process. Rejections and queue failures are
/// scoped to a single key and are surfaced to the caller that triggered them.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A limiter dimension rejected the request
    #[error("Rate limit exceeded on {dimension} for '{identifier}'")]
    RateLimitExceeded {
        dimension: Dimension,
        identifier: String,
    },

    /// The per-key queue was at capacity and no fallback was available
    #[error("Queue full for key '{key}'")]
    QueueFull { key: String },

    /// A queued request missed its wait deadline
    #[error("Request queued on '{key}' timed out after {waited_ms}ms")]
    QueueTimeout { key: String, waited_ms: u64 },

    /// The queue holding the request was cleared before it ran
    #[error("Queue for key '{key}' was cleared")]
    QueueCleared { key: String },

    /// The fallback ran and failed; displays as the fallback's own error
    #[error("{source}")]
    FallbackFailed {
        key: String,
        #[source]
        source: BoxError,
    },

    /// The fallback did not finish within its timeout
    #[error("Fallback for key '{key}' timed out after {timeout:?}")]
    FallbackTimeout { key: String, timeout: Duration },

    /// Every fallback tier was at capacity
    #[error("All {tiers} fallback tiers exhausted for key '{key}'")]
    FallbackExhausted { key: String, tiers: usize },

    /// The unit of work itself failed
    #[error("{0}")]
    Execution(BoxError),
}

impl TurnstileError {
    /// Whether the surrounding layer should answer "too many requests".
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::QueueFull { .. } | Self::FallbackExhausted { .. }
        )
    }

    /// Whether this is a wait-deadline or fallback timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::QueueTimeout { .. } | Self::FallbackTimeout { .. })
    }

    /// Whether the request was cancelled by a queue clear.
    pub fn is_cleared(&self) -> bool {
        matches!(self, Self::QueueCleared { .. })
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_family() {
        let err = TurnstileError::RateLimitExceeded {
            dimension: Dimension::Ip,
            identifier: "10.0.0.1".to_string(),
        };
        assert!(err.is_rejection());
        assert_eq!(err.to_string(), "Rate limit exceeded on ip for '10.0.0.1'");

        assert!(TurnstileError::QueueFull { key: "k".into() }.is_rejection());
        assert!(!TurnstileError::QueueCleared { key: "k".into() }.is_rejection());
    }

    #[test]
    fn test_fallback_failure_is_not_masked() {
        let err = TurnstileError::FallbackFailed {
            key: "GET /orders".to_string(),
            source: "upstream cache miss".into(),
        };
        assert_eq!(err.to_string(), "upstream cache miss");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_timeout_family() {
        assert!(TurnstileError::QueueTimeout { key: "k".into(), waited_ms: 50 }.is_timeout());
        assert!(TurnstileError::FallbackTimeout {
            key: "k".into(),
            timeout: Duration::from_millis(5)
        }
        .is_timeout());
    }
}
