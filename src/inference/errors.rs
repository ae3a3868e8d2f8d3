//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to
//! build meaningful log entries and to decide on failover.

use thiserror::Error;

/// Errors surfaced by the injected LLM transport or by response parsing.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the provider failed.
    #[error("connection failed to {provider}: {reason}")]
    ConnectionFailed { provider: String, reason: String },

    /// The provider did not respond in time.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the provider.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The provider answered with a body this crate cannot interpret.
    #[error("malformed response from {provider}: {reason}")]
    MalformedResponse { provider: String, reason: String },

    /// Every provider in the failover chain failed.
    #[error("all providers unavailable (tried: {})", attempted.join(", "))]
    AllProvidersFailed { attempted: Vec<String> },
}

impl InferenceError {
    /// Whether the failover layer should try the next provider.
    ///
    /// Any single-provider failure qualifies; only `AllProvidersFailed`
    /// ends the chain.
    pub fn is_failover_candidate(&self) -> bool {
        !matches!(self, InferenceError::AllProvidersFailed { .. })
    }

    /// Whether the error is a rate-limit or overload response.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, InferenceError::HttpError { status: 429 | 529, .. })
    }
}
