//! Completion backend trait and shared HTTP error mapping.

use async_trait::async_trait;

use crate::error::LlmError;

/// What a backend can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Largest prompt, in Unicode scalar values.
    pub max_input_chars: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_input_chars: 24_000,
        }
    }
}

/// A single-shot text completion backend.
///
/// Implementations make exactly one request per call. Timeouts and retries
/// are applied by [`AiClient`](crate::llm::AiClient).
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Provider name for logs and errors.
    fn name(&self) -> &str;

    /// Model identifier, if the backend has one.
    fn model_name(&self) -> &str {
        ""
    }

    fn capabilities(&self) -> Capabilities;

    /// Complete a prompt. May return an empty string; callers decide what
    /// that means.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Map a non-success HTTP status to an [`LlmError`].
///
/// 429 and 5xx are transient; everything else is not.
pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> LlmError {
    let transient = status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
    let mut excerpt: String = body.chars().take(200).collect();
    if excerpt.len() < body.len() {
        excerpt.push('…');
    }
    LlmError::RequestFailed {
        provider: provider.to_string(),
        reason: format!("HTTP {status}: {excerpt}"),
        transient,
    }
}

/// Map a `reqwest` transport failure. Connection and timeout errors are
/// transient; request-building errors are not.
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        return LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("request timed out: {err}"),
            transient: true,
        };
    }
    LlmError::RequestFailed {
        provider: provider.to_string(),
        reason: err.to_string(),
        transient: err.is_connect() || err.is_request(),
    }
}

/// Build the shared HTTP client for a backend.
pub(crate) fn http_client(provider: &str) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .user_agent(concat!("mail-assist/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| LlmError::Setup {
            provider: provider.to_string(),
            reason: e.to_string(),
        })
}
