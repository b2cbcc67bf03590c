//! Error types for the session layer.

use std::path::Path;

use arrow::error::ArrowError;
use thiserror::Error;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur while serving datasets, pages and analyses.
///
/// Cache misses and out-of-range pages are not errors. `NotFound` is reserved for
/// lookups of dataset ids that were never registered or have already been swept.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The dataset id is unknown (never registered, or evicted by the sweep).
    #[error("Dataset not found: {dataset_id}")]
    NotFound { dataset_id: String },

    /// The request did not pass the API key gate.
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// The client exhausted its request window.
    #[error("Too many requests. Retry after {retry_after_secs} seconds")]
    TooManyRequests { retry_after_secs: u64 },

    /// The LLM call failed or timed out. Never cached.
    #[error("Upstream failure from {provider}: {message}")]
    UpstreamFailure { provider: String, message: String },

    /// Backing storage for a dataset is missing or unreadable.
    #[error("Storage unavailable at {path}: {message}")]
    StorageUnavailable { path: String, message: String },

    /// Malformed or oversized request input.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The storage was readable but its content could not be decoded.
    #[error("Failed to decode table data: {0}")]
    Arrow(#[from] ArrowError),

    /// Background task or lock failure.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SessionError {
    /// Creates an invalid input error with the given message.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates a storage error for the given path.
    pub fn storage(path: &Path, message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            path: path.display().to_string(),
            message: message.into(),
        }
    }

    /// Creates an upstream failure for the given provider.
    pub fn upstream(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamFailure {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error with the given message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an internal error with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::TooManyRequests { .. } | SessionError::UpstreamFailure { .. }
        )
    }

    /// Returns the suggested retry delay in seconds, if available.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            SessionError::TooManyRequests { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// HTTP status code used at the request boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            SessionError::InvalidInput { .. } | SessionError::Arrow(_) => 400,
            SessionError::Unauthorized { .. } => 401,
            SessionError::NotFound { .. } => 404,
            SessionError::TooManyRequests { .. } => 429,
            SessionError::UpstreamFailure { .. } => 502,
            SessionError::StorageUnavailable { .. } => 503,
            SessionError::Configuration { .. } | SessionError::Internal { .. } => 500,
        }
    }

    /// Message safe to show to end users.
    ///
    /// Client errors carry their specific message; upstream and internal failures
    /// collapse to a generic text so no provider or filesystem detail leaks out.
    pub fn public_message(&self) -> String {
        match self {
            SessionError::UpstreamFailure { .. } => {
                "Analysis service is temporarily unavailable, please retry".to_string()
            }
            SessionError::StorageUnavailable { .. } => {
                "Dataset storage is no longer available, please upload the file again"
                    .to_string()
            }
            SessionError::Configuration { .. } | SessionError::Internal { .. } => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(format!("background task failed: {err}"))
    }
}
