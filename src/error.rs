//! Error types for metacog-core.

use thiserror::Error;

/// Result type alias using metacog-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during validation orchestration.
#[derive(Error, Debug)]
pub enum Error {
    /// Language-model provider call timed out (transient, retried per stage)
    #[error("Provider call timed out after {duration_ms}ms")]
    ProviderTimeout { duration_ms: u64 },

    /// Language-model provider is unavailable (transient, retried per stage)
    #[error("Provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    /// Content could not be decomposed into a task graph (fatal for the session)
    #[error("Decomposition failed: {reason}")]
    Decomposition { reason: String },

    /// Candidate failed verification (non-fatal, recorded as issues)
    #[error("Verification failure: {0}")]
    Verification(String),

    /// Orchestration was cancelled cooperatively
    #[error("Orchestration cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a provider timeout error.
    pub fn provider_timeout(duration_ms: u64) -> Self {
        Self::ProviderTimeout { duration_ms }
    }

    /// Create a provider unavailable error.
    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            message: message.into(),
        }
    }

    /// Create a decomposition error.
    pub fn decomposition(reason: impl Into<String>) -> Self {
        Self::Decomposition {
            reason: reason.into(),
        }
    }

    /// Whether this error is transient and eligible for per-stage retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderTimeout { .. } | Self::ProviderUnavailable { .. }
        )
    }
}
