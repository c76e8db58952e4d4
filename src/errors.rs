//! Domain error types for sagebot.
//!
//! Typed errors at module boundaries replace string-encoded errors and
//! enable structured error handling via pattern matching.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Errors from LLM backend operations.
///
/// Embedded in `anyhow::Error` so the `LlmProvider` trait signature
/// (`-> anyhow::Result<Completion>`) stays unchanged while callers
/// can downcast: `e.downcast_ref::<ProviderError>()`.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Backend call timed out after {0}ms")]
    Timeout(u64),

    #[error("Rate limited (status {status}): retry after {retry_after_ms}ms")]
    RateLimited { status: u16, retry_after_ms: u64 },

    #[error("Backend error (status {status}): {message}")]
    BackendError { status: u16, message: String },

    #[error("Malformed request: {0}")]
    InvalidRequest(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Malformed requests and cancellations short-circuit the retry loop;
    /// everything else is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProviderError::InvalidRequest(_) | ProviderError::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Tool provider errors
// ---------------------------------------------------------------------------

/// Errors from auxiliary tool providers (file access, shell, lookup APIs).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Provider error: {0}")]
    ProviderError(String),
}

impl ToolError {
    /// Invalid arguments won't get better on retry; the rest might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ToolError::InvalidArgs(_))
    }
}
