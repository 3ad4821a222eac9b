//! LLM provider abstraction.
//!
//! A provider implements the [`LlmClient`] trait: one non-streaming
//! `generate` call that translates the internal message model to the wire
//! format and back, honours the cancel token, and wraps transport failures
//! in the retry policy.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use ema_core::types::{LlmResponse, Message};

pub mod openai;
pub mod retry;

pub use retry::{retry_async, RetryConfig};

/// Provider-agnostic tool definition handed to `generate`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Errors a provider call can surface. `Cancelled` and `RetryExhausted` are
/// distinguished kinds: the agent loop maps them to different terminals and
/// the retry wrapper never retries a cancellation.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request cancelled")]
    Cancelled,

    #[error("LLM call failed after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    /// Provider-reported error, including error envelopes in 2xx bodies.
    #[error("API error: {0}")]
    Api(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// The adapter contract the agent loop depends on.
///
/// A response with no tool calls is a normal terminal, never an error.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider identifier (e.g. "openai").
    fn id(&self) -> &str;

    /// Generate one completion. The system prompt is supplied separately and
    /// is never part of `messages`. Cancellation must surface as
    /// [`ProviderError::Cancelled`].
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        system_prompt: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError>;
}
