use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("image cannot be reduced under the size ceiling")]
    Irreducible,

    #[error("URL map corrupted: {0}")]
    MapCorrupted(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;
