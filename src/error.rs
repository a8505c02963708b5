//! Error types for mail-assist.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Top-level error type for a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Error {
    /// Classify this error for logging and event records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Parse(e) => e.kind(),
            Self::Registry(_) => ErrorKind::NoAssistantMatched,
            Self::Prompt(_) => ErrorKind::PromptTooLarge,
            Self::Llm(e) => e.kind(),
            Self::Compose(_) => ErrorKind::ComposeError,
            Self::Transport(_) => ErrorKind::TransportError,
        }
    }
}

/// Stable error classification reported to the logging collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Config,
    MalformedMessage,
    UnsupportedEncoding,
    NoAssistantMatched,
    PromptTooLarge,
    #[serde(rename = "AIBackendUnavailable")]
    AiBackendUnavailable,
    #[serde(rename = "AIBackendEmptyResponse")]
    AiBackendEmptyResponse,
    ComposeError,
    TransportError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "Config",
            Self::MalformedMessage => "MalformedMessage",
            Self::UnsupportedEncoding => "UnsupportedEncoding",
            Self::NoAssistantMatched => "NoAssistantMatched",
            Self::PromptTooLarge => "PromptTooLarge",
            Self::AiBackendUnavailable => "AIBackendUnavailable",
            Self::AiBackendEmptyResponse => "AIBackendEmptyResponse",
            Self::ComposeError => "ComposeError",
            Self::TransportError => "TransportError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound message parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Unsupported encoding: cannot decode {content_type} part declared as {charset}")]
    UnsupportedEncoding {
        charset: String,
        content_type: String,
    },
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedMessage { .. } => ErrorKind::MalformedMessage,
            Self::UnsupportedEncoding { .. } => ErrorKind::UnsupportedEncoding,
        }
    }
}

/// Assistant resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No assistant matched recipients [{recipients}] and no catch-all is configured")]
    NoAssistantMatched { recipients: String },
}

/// Prompt construction errors.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Prompt too large: {size} chars after truncation, backend allows {limit}")]
    PromptTooLarge { size: usize, limit: usize },
}

/// AI backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed {
        provider: String,
        reason: String,
        /// Whether the failure is worth one retry (connection reset, 5xx, 429).
        transient: bool,
    },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} unavailable after {attempts} attempt(s): {reason}")]
    Unavailable {
        provider: String,
        attempts: u32,
        reason: String,
    },

    #[error("Provider {provider} returned an empty completion")]
    EmptyResponse { provider: String },

    #[error("Failed to create provider {provider}: {reason}")]
    Setup { provider: String, reason: String },
}

impl LlmError {
    /// Transient failures get exactly one retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { transient, .. } => *transient,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyResponse { .. } => ErrorKind::AiBackendEmptyResponse,
            _ => ErrorKind::AiBackendUnavailable,
        }
    }
}

/// Reply composition errors.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("Original message has no usable sender address to reply to")]
    MissingSender,

    #[error("No address available to send the reply from")]
    MissingFrom,

    #[error("Invalid {field} address \"{address}\": {reason}")]
    InvalidAddress {
        field: &'static str,
        address: String,
        reason: String,
    },

    #[error("Failed to build reply: {0}")]
    Build(String),
}

/// Outbound transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport {name} failed to send: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for mail-assist.
pub type Result<T> = std::result::Result<T, Error>;
