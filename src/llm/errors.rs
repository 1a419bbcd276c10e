//! Error types for model calls.

use thiserror::Error;

/// Errors raised by a [`ChatBackend`](crate::llm::backend::ChatBackend).
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed before a response arrived.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The call did not finish in time.
    #[error("Request timed out")]
    Timeout,

    /// Quota or rate limit exhausted.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Upstream answered with a non-success status.
    #[error("Upstream returned status {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Message extracted from the error body.
        message: String,
    },

    /// No API key configured.
    #[error("API key required for {0}")]
    ApiKeyRequired(String),

    /// Endpoint URL could not be built.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Coarse failure category surfaced to the UI layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FailureKind {
    /// Quota or rate limit exhausted.
    RateLimited,
    /// The call exceeded its time budget.
    Timeout,
    /// Network-level failure.
    Transport,
    /// Upstream refused or failed the request.
    Upstream,
}

impl FailureKind {
    /// Short human label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::RateLimited => "rate limit reached",
            Self::Timeout => "request timed out",
            Self::Transport => "network error",
            Self::Upstream => "service error",
        }
    }
}

impl LlmError {
    /// Check if this error comes from quota exhaustion.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Category reported to callers of the message exchange.
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::RateLimited(_) => FailureKind::RateLimited,
            Self::Timeout => FailureKind::Timeout,
            Self::Http(err) if err.is_timeout() => FailureKind::Timeout,
            Self::Http(_) => FailureKind::Transport,
            Self::Api { .. } | Self::ApiKeyRequired(_) | Self::InvalidUrl(_) => {
                FailureKind::Upstream
            }
        }
    }
}

/// Convenience result alias for model calls.
pub type LlmResult<T> = Result<T, LlmError>;
