use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(#[from] murmur_transport::TransportError),

    #[error("provider error: {0}")]
    Provider(#[from] murmur_llm::ProviderError),

    #[error("store error: {0}")]
    Store(#[from] murmur_store::StoreError),

    #[error("credit system error: {0}")]
    Credit(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
