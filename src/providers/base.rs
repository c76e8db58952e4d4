//! Base interfaces to the external collaborators.
//!
//! The routing core never talks to a backend directly; it goes through these
//! traits so tests can inject deterministic fakes and production can wire in
//! real clients.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// A completed LLM backend call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub token_count: u64,
}

/// Abstract LLM backend.
///
/// Failures should embed a [`crate::errors::ProviderError`] so callers can
/// downcast and classify them for retry decisions.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a prompt and get the generated text plus token usage.
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion>;
}

/// Abstract auxiliary tool provider (paper search, financial lookup,
/// file I/O, shell execution).
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Tool name as it appears in `tools_used` lists and breaker keys.
    fn name(&self) -> &str;

    /// Invoke the tool with structured arguments.
    ///
    /// Failures should embed a [`crate::errors::ToolError`].
    async fn invoke(&self, args: &Value) -> Result<Value>;
}
