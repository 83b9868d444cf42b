//! Image handling: deterministic resampling under provider size ceilings,
//! and a process-wide content-addressed download cache.
//!
//! Determinism is load-bearing: resampled bytes land inside the cached
//! prompt prefix, so the same input bytes must always produce the same
//! output bytes. Codec options are pinned and dimensions rounded before
//! encoding; nothing here consults time, randomness, or environment.

pub mod cache;
pub mod error;
pub mod resample;

pub use cache::DownloadCache;
pub use error::{ImageError, Result};
pub use resample::{base64_len, fit_under_ceiling};
