//! Error types for the profile store

use thiserror::Error;

use crate::types::SeriesId;

/// Main error type for the profile store
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk encoding or decoding error
    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Postings index or matcher error
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Series store error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Chunk codec errors
///
/// Decode failures are never returned from `Iterator::next`; iterators stash
/// them and expose them through `ChunkIterator::err` once exhausted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// Bit stream is truncated or holds an impossible encoding
    #[error("Chunk decode failed: {0}")]
    Decode(String),

    /// Unknown codec tag
    #[error("Invalid chunk encoding: {0}")]
    InvalidEncoding(u8),

    /// `append_at` target does not lie past the current tail
    #[error("Invalid row index {requested}: chunk already holds {current} samples")]
    InvalidRowIndex {
        /// Sample count requested after the write
        requested: usize,
        /// Sample count currently stored
        current: usize,
    },

    /// The u16 sample header would overflow
    #[error("Chunk capacity exceeded: limit is {limit} samples")]
    CapacityExceeded {
        /// Maximum samples per chunk
        limit: usize,
    },
}

impl ChunkError {
    pub(crate) fn truncated() -> Self {
        ChunkError::Decode("unexpected end of bit stream".to_string())
    }
}

/// Postings index errors
#[derive(Error, Debug)]
pub enum IndexError {
    /// Label, value or series lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Matcher could not be built
    #[error("Invalid matcher: {0}")]
    InvalidMatcher(String),
}

/// Series store errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Sample timestamp does not advance the series
    #[error("Out of order sample for series {series}: timestamp {timestamp} <= max time {max_time}")]
    OutOfOrderSample {
        /// Series the append targeted
        series: SeriesId,
        /// Rejected timestamp
        timestamp: i64,
        /// Newest timestamp already stored
        max_time: i64,
    },

    /// Period or sample type differs from the one the series was created with
    #[error("Schema mismatch on {field}: series has {expected}, profile has {actual}")]
    SchemaMismatch {
        /// Which part of the schema differs
        field: &'static str,
        /// Stored schema
        expected: String,
        /// Schema of the rejected profile
        actual: String,
    },

    /// Series ID not present in the head
    #[error("Series not found: {0}")]
    SeriesNotFound(SeriesId),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
