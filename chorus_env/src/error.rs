//! Error types for the Chorus environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The shared store could not be reached (connection refused, outage, etc.)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The shared store answered but the operation failed
    #[error("Store error: {0}")]
    StoreError(String),

    /// Value serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates an unavailability error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Creates a generic store error.
    pub fn store(msg: impl std::fmt::Display) -> Self {
        Self::StoreError(msg.to_string())
    }

    /// Returns true if the failure means the store is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Timeout(_))
    }
}
