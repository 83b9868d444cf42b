use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::warn;

use crate::request::{LlmCompletion, LlmRequest};

/// Common interface for all LLM providers.
///
/// Providers must honor `stop_sequences`, `cache_control` markers on
/// messages, and prefill mode (a trailing assistant-participant message with
/// content becomes the continuation seed).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a completion request, wait for the full response.
    async fn complete(&self, req: &LlmRequest) -> Result<LlmCompletion, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Unavailable(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Parse(_) | ProviderError::Cancelled => false,
        }
    }
}

/// First backoff delay in milliseconds.
const BACKOFF_BASE_MS: u64 = 1_000;
/// Ceiling on any single backoff delay.
const BACKOFF_MAX_MS: u64 = 30_000;
/// Attempts before the last error is surfaced.
const MAX_ATTEMPTS: u32 = 3;

/// Call the provider with bounded exponential backoff. Rate-limit errors
/// honor the server-provided delay.
pub async fn complete_with_retry(
    provider: &dyn LlmProvider,
    req: &LlmRequest,
) -> Result<LlmCompletion, ProviderError> {
    let mut delay_ms = BACKOFF_BASE_MS;

    for attempt in 1..=MAX_ATTEMPTS {
        match provider.complete(req).await {
            Ok(completion) => return Ok(completion),
            Err(e) if !e.is_retryable() || attempt == MAX_ATTEMPTS => return Err(e),
            Err(ProviderError::RateLimited { retry_after_ms }) => {
                warn!(provider = provider.name(), attempt, retry_after_ms, "rate limited");
                sleep(Duration::from_millis(retry_after_ms.min(BACKOFF_MAX_MS))).await;
            }
            Err(e) => {
                warn!(provider = provider.name(), attempt, error = %e, "completion failed, retrying");
                sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(BACKOFF_MAX_MS);
            }
        }
    }

    unreachable!("retry loop exited without returning")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ContentBlock, RequestConfig, StopReason, Usage};
    use murmur_core::config::CompletionMode;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl LlmProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _req: &LlmRequest) -> Result<LlmCompletion, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(ProviderError::Unavailable("down".into()));
            }
            Ok(LlmCompletion {
                content: vec![ContentBlock::text("ok")],
                stop_reason: StopReason::EndTurn,
                stop_sequence: None,
                usage: Usage::default(),
                model: "test".into(),
            })
        }
    }

    fn request() -> LlmRequest {
        LlmRequest {
            messages: vec![],
            system_prompt: String::new(),
            config: RequestConfig {
                model: "test".into(),
                temperature: 1.0,
                top_p: None,
                max_tokens: 16,
                mode: CompletionMode::Prefill,
                prefill_thinking: false,
                turn_end_token: None,
                message_delimiter: None,
                prompt_caching: true,
            },
            tools: vec![],
            stop_sequences: vec![],
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_unavailability() {
        let provider = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };
        let completion = complete_with_retry(&provider, &request()).await.unwrap();
        assert_eq!(completion.text(), "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_do_not_retry() {
        struct Refuses;
        #[async_trait]
        impl LlmProvider for Refuses {
            fn name(&self) -> &str {
                "refuses"
            }
            async fn complete(&self, _req: &LlmRequest) -> Result<LlmCompletion, ProviderError> {
                Err(ProviderError::Api {
                    status: 400,
                    message: "bad request".into(),
                })
            }
        }
        let err = complete_with_retry(&Refuses, &request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 400, .. }));
    }
}
