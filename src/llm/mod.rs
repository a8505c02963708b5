//! AI backend integration.
//!
//! Supports:
//! - **Anthropic**: Messages API
//! - **OpenAI**: Chat Completions, including OpenAI-compatible local servers
//! - **HTTP API**: a plain `GET ?content=` endpoint returning `{success, message}`
//!
//! Backends implement [`CompletionBackend`]; [`AiClient`] wraps one with the
//! timeout and retry policy.

pub mod anthropic;
pub mod client;
pub mod http_api;
pub mod openai;
pub mod provider;

pub use client::AiClient;
pub use provider::{Capabilities, CompletionBackend};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::config::{Lookup, env_parse, env_var};
use crate::error::{ConfigError, LlmError};

/// Supported AI backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
    HttpApi,
}

impl FromStr for LlmBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "http_api" | "http" => Ok(Self::HttpApi),
            other => Err(ConfigError::InvalidValue {
                key: "MAIL_ASSIST_LLM_BACKEND".into(),
                message: format!(
                    "unknown backend '{other}' (expected anthropic, openai or http_api)"
                ),
            }),
        }
    }
}

impl fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::HttpApi => "http_api",
        })
    }
}

/// Configuration for creating an AI backend.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
    /// Override for the provider's API base URL.
    pub base_url: Option<String>,
    /// Endpoint for [`LlmBackend::HttpApi`].
    pub api_url: Option<String>,
    pub max_tokens: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub max_input_chars: usize,
}

impl LlmConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let backend: LlmBackend =
            env_parse(lookup, "MAIL_ASSIST_LLM_BACKEND", LlmBackend::Anthropic)?;

        let (key_var, default_model) = match backend {
            LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", "claude-sonnet-4-20250514"),
            LlmBackend::OpenAi => ("OPENAI_API_KEY", "gpt-4o-mini"),
            LlmBackend::HttpApi => ("MAIL_ASSIST_API_KEY", ""),
        };
        let api_key = env_var(lookup, key_var).unwrap_or_default();
        if backend == LlmBackend::Anthropic && api_key.is_empty() {
            return Err(ConfigError::MissingEnvVar(key_var.to_string()));
        }

        let api_url = env_var(lookup, "MAIL_ASSIST_API_URL");
        if backend == LlmBackend::HttpApi && api_url.is_none() {
            return Err(ConfigError::MissingEnvVar("MAIL_ASSIST_API_URL".into()));
        }

        let timeout_secs: u64 = env_parse(lookup, "MAIL_ASSIST_AI_TIMEOUT_SECS", 60)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_ASSIST_AI_TIMEOUT_SECS".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model: env_var(lookup, "MAIL_ASSIST_MODEL")
                .unwrap_or_else(|| default_model.to_string()),
            base_url: env_var(lookup, "MAIL_ASSIST_LLM_BASE_URL"),
            api_url,
            max_tokens: env_parse(lookup, "MAIL_ASSIST_MAX_TOKENS", 1024)?,
            timeout: Duration::from_secs(timeout_secs),
            max_input_chars: env_parse(
                lookup,
                "MAIL_ASSIST_MAX_INPUT_CHARS",
                Capabilities::default().max_input_chars,
            )?,
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_input_chars: self.max_input_chars,
        }
    }
}

/// Create an AI backend from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn CompletionBackend>, LlmError> {
    let backend: Arc<dyn CompletionBackend> = match config.backend {
        LlmBackend::Anthropic => Arc::new(anthropic::AnthropicBackend::new(
            config.api_key.clone(),
            config.base_url.clone(),
            &config.model,
            config.max_tokens,
            config.capabilities(),
        )?),
        LlmBackend::OpenAi => Arc::new(openai::OpenAiBackend::new(
            config.api_key.clone(),
            config.base_url.clone(),
            &config.model,
            config.max_tokens,
            config.capabilities(),
        )?),
        LlmBackend::HttpApi => {
            let url = config.api_url.as_deref().ok_or_else(|| LlmError::Setup {
                provider: "http_api".into(),
                reason: "MAIL_ASSIST_API_URL is not set".into(),
            })?;
            Arc::new(http_api::HttpApiBackend::new(
                url,
                config.timeout,
                config.capabilities(),
            )?)
        }
    };

    tracing::info!(
        backend = %config.backend,
        model = backend.model_name(),
        max_input_chars = config.max_input_chars,
        "AI backend ready"
    );
    Ok(backend)
}
