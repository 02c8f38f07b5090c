//! Error taxonomy for the dispatch core.

use chorus_env::EnvError;
use thiserror::Error;

/// Errors surfaced by the dispatch core.
///
/// Only `Validation`, `QueueState` and `Internal` abort a run. Provider
/// failures and timeouts are recorded on the result they belong to, rate
/// limit rejections are returned to the caller that asked, and store
/// unavailability is logged and degraded rather than returned.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Malformed configuration, rejected before a run starts
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Configuration file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// Operation on an unknown id, or mirror and memory disagree
    #[error("Queue state error: {0}")]
    QueueState(String),

    /// A single provider call failed after all retries
    #[error("Provider {provider} query failed: {message}")]
    ProviderQuery { provider: String, message: String },

    /// A single provider call exceeded the per-call timeout
    #[error("Provider {provider} call timed out after {timeout_ms}ms")]
    CallTimeout { provider: String, timeout_ms: u64 },

    /// A rate-limit scope rejected the request
    #[error("Rate limit exceeded for {scope}, retry after {retry_after_secs}s")]
    RateLimitExceeded { scope: String, retry_after_secs: u64 },

    /// The shared store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A dispatch task panicked or was aborted
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Creates a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Creates a queue state error.
    pub fn queue_state(msg: impl Into<String>) -> Self {
        Self::QueueState(msg.into())
    }

    /// Returns true if this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Config(_) | Self::QueueState(_) | Self::Internal(_)
        )
    }

    /// Seconds the caller should wait, for rate-limit rejections.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl From<EnvError> for DispatchError {
    fn from(e: EnvError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_split() {
        assert!(DispatchError::queue_state("unknown id").is_fatal());
        assert!(DispatchError::validation("batch_size").is_fatal());
        assert!(!DispatchError::CallTimeout { provider: "openai".into(), timeout_ms: 5 }.is_fatal());
        assert!(!DispatchError::StoreUnavailable("down".into()).is_fatal());
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let err = DispatchError::RateLimitExceeded { scope: "trigger:org".into(), retry_after_secs: 12 };
        assert_eq!(err.retry_after_secs(), Some(12));
        assert!(err.to_string().contains("12s"));
    }
}
