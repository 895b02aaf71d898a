//! Error taxonomy for the multiplayer middleware.
//!
//! Construction-time problems are fatal (`Configuration`); transport and
//! hydration failures are recoverable and retried or resurfaced to the caller;
//! conflict-resolution failures degrade to the keep-remote strategy and are
//! never fatal.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid options detected while building a store. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Token issuance or refresh failed. Recoverable by a later refresh.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Transport failure. `retryable` failures go through the retry policy.
    #[error("network error: {message}")]
    Network { message: String, retryable: bool },

    /// The circuit breaker is open; writes fail fast until the cooldown ends.
    #[error("circuit breaker open, failing fast")]
    CircuitOpen,

    /// A remote operation did not complete within the configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Hydration failed; the store stays un-hydrated and the caller may retry.
    #[error("hydration failed: {0}")]
    Hydration(String),

    /// The conflict policy itself failed. The resolver falls back to
    /// keep-remote, so this surfaces only in logs.
    #[error("conflict resolution failed: {0}")]
    ConflictResolution(String),

    /// Operation attempted after `destroy()`.
    #[error("store has been destroyed")]
    Destroyed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn network(message: impl Into<String>) -> Self {
        Error::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether the retry policy should attempt this error again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { retryable, .. } => *retryable,
            Error::Timeout(_) => true,
            Error::Authentication(_) => true,
            _ => false,
        }
    }
}
