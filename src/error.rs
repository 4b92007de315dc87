//! Error types for the cache adapter.
//!
//! Logical misses are not errors: they surface as `Ok(None)` from the read
//! operations. Everything here is a condition the caller has to handle.

use thiserror::Error;

use crate::backend::BackendError;
use crate::cache::compressor::CompressionError;

/// Unified error type for cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Empty key, past expiration or another unusable argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored item could not be decoded.
    #[error("Corrupt cache data: {0}")]
    CorruptData(#[from] CorruptData),

    /// The backend client failed; propagated unchanged.
    #[error("Backend error: {0}")]
    Backend(#[source] BackendError),

    /// The cancellation token fired before the operation completed.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Reasons a stored item is rejected by the decoder.
#[derive(Error, Debug)]
pub enum CorruptData {
    #[error("unknown flag bits {0:#x}")]
    UnknownFlags(u32),

    #[error("item of {0} bytes is too short for a sliding header")]
    TruncatedHeader(usize),

    #[error("shard list of {0} bytes is not a multiple of 16")]
    ShardList(usize),

    #[error(transparent)]
    Compression(#[from] CompressionError),
}

impl From<BackendError> for CacheError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Cancelled => CacheError::Cancelled,
            other => CacheError::Backend(other),
        }
    }
}

impl From<CompressionError> for CacheError {
    fn from(err: CompressionError) -> Self {
        CacheError::CorruptData(CorruptData::Compression(err))
    }
}

impl CacheError {
    /// Whether this error reports undecodable stored data.
    pub fn is_corrupt_data(&self) -> bool {
        matches!(self, CacheError::CorruptData(_))
    }
}

/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
