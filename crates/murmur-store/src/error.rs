use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("activation {id} not found")]
    ActivationNotFound { id: i64 },
}

pub type Result<T> = std::result::Result<T, StoreError>;
