use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message {id} no longer exists")]
    MessageDeleted { id: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("webhooks unsupported in this channel")]
    WebhookUnsupported,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("transport request failed: {0}")]
    Request(String),

    #[error("channel {id} not found")]
    ChannelNotFound { id: u64 },
}

impl TransportError {
    /// Whether a retry with backoff has any chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::RateLimited { .. } | TransportError::Request(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
