//! Simple query-string completion API.
//!
//! `GET <url>?content=<prompt>&timeout=<secs>` answered by
//! `{"success": bool, "message": string}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    Capabilities, CompletionBackend, http_client, status_error, transport_error,
};

const PROVIDER: &str = "http_api";

pub struct HttpApiBackend {
    client: reqwest::Client,
    url: String,
    /// Forwarded to the server as its own processing budget.
    server_timeout: Duration,
    capabilities: Capabilities,
}

impl HttpApiBackend {
    pub fn new(
        url: impl Into<String>,
        server_timeout: Duration,
        capabilities: Capabilities,
    ) -> Result<Self, LlmError> {
        let url = url.into();
        reqwest::Url::parse(&url).map_err(|e| LlmError::Setup {
            provider: PROVIDER.to_string(),
            reason: format!("invalid URL {url}: {e}"),
        })?;
        Ok(Self {
            client: http_client(PROVIDER)?,
            url,
            server_timeout,
            capabilities,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl CompletionBackend for HttpApiBackend {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        debug!(url = %self.url, "Sending HTTP API request");

        let timeout_secs = self.server_timeout.as_secs().to_string();
        let resp = self
            .client
            .get(&self.url)
            .query(&[("content", prompt), ("timeout", timeout_secs.as_str())])
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        if !status.is_success() {
            return Err(status_error(PROVIDER, status, &text));
        }

        let parsed: ApiResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;
        if !parsed.success {
            return Err(LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!(
                    "server reported failure: {}",
                    parsed.message.as_deref().unwrap_or("(no message)")
                ),
            });
        }
        Ok(parsed.message.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        let err = HttpApiBackend::new(
            "not a url",
            Duration::from_secs(30),
            Capabilities::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, LlmError::Setup { .. }));
    }

    #[test]
    fn parses_success_payload() {
        let parsed: ApiResponse =
            serde_json::from_str(r#"{"success": true, "message": "Hi!"}"#).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.message.as_deref(), Some("Hi!"));

        let parsed: ApiResponse = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert!(!parsed.success);
    }
}
