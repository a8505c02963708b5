//! Timeout and single-retry policy around a [`CompletionBackend`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::llm::provider::{Capabilities, CompletionBackend};

/// Total attempts for one completion: the first try plus one retry.
const MAX_ATTEMPTS: u32 = 2;

/// AI client adapter used by the pipeline.
#[derive(Clone)]
pub struct AiClient {
    backend: Arc<dyn CompletionBackend>,
    timeout: Duration,
    retry_delay: Duration,
}

impl AiClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.backend.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    /// Complete a prompt.
    ///
    /// Each attempt is bounded by the configured timeout. Transient failures
    /// get exactly one retry; anything else, or a second failure, becomes
    /// [`LlmError::Unavailable`]. An empty completion is
    /// [`LlmError::EmptyResponse`] and is never retried.
    pub async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let provider = self.backend.name().to_string();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                provider = %provider,
                attempt,
                prompt_chars = prompt.chars().count(),
                "Requesting completion"
            );

            let result = match tokio::time::timeout(self.timeout, self.backend.complete(prompt))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout {
                    provider: provider.clone(),
                    timeout: self.timeout,
                }),
            };

            match result {
                Ok(text) if text.trim().is_empty() => {
                    warn!(provider = %provider, attempt, "Backend returned an empty completion");
                    return Err(LlmError::EmptyResponse { provider });
                }
                Ok(text) => {
                    info!(
                        provider = %provider,
                        attempt,
                        reply_chars = text.chars().count(),
                        "Completion received"
                    );
                    return Ok(text);
                }
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!(
                        provider = %provider,
                        attempt,
                        error = %e,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "Transient backend failure, retrying once"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e @ LlmError::EmptyResponse { .. }) => return Err(e),
                Err(e) => {
                    warn!(provider = %provider, attempt, error = %e, "Backend unavailable");
                    return Err(LlmError::Unavailable {
                        provider,
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    /// Backend that replays scripted results and counts calls.
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: AtomicU32,
        delay: Option<Duration>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<String, LlmError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("fallthrough".into()))
        }
    }

    fn transient() -> Result<String, LlmError> {
        Err(LlmError::RequestFailed {
            provider: "scripted".into(),
            reason: "HTTP 503".into(),
            transient: true,
        })
    }

    fn client(backend: Arc<ScriptedBackend>) -> AiClient {
        AiClient::new(backend, Duration::from_secs(5)).with_retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok("Hello!".into())]));
        let text = client(backend.clone()).complete("hi").await.unwrap();
        assert_eq!(text, "Hello!");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_retried_once() {
        let backend = Arc::new(ScriptedBackend::new(vec![transient(), Ok("ok".into())]));
        let text = client(backend.clone()).complete("hi").await.unwrap();
        assert_eq!(text, "ok");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn two_failures_become_unavailable() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            transient(),
            transient(),
            Ok("never".into()),
        ]));
        let err = client(backend.clone()).complete("hi").await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable { attempts: 2, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(LlmError::RequestFailed {
            provider: "scripted".into(),
            reason: "HTTP 401".into(),
            transient: false,
        })]));
        let err = client(backend.clone()).complete("hi").await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable { attempts: 1, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_completion_is_fatal_and_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok("  \n ".into())]));
        let err = client(backend.clone()).complete("hi").await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out_and_retries() {
        let backend = Arc::new(ScriptedBackend {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            delay: Some(Duration::from_secs(60)),
        });
        let err = AiClient::new(backend.clone(), Duration::from_secs(1))
            .with_retry_delay(Duration::ZERO)
            .complete("hi")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Unavailable { attempts: 2, .. }));
        assert!(err.to_string().contains("timed out"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }
}
