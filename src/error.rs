//! Error types
//!
//! Everything here is returned as a typed result to the caller. Exhaustion
//! and backend unavailability are separate variants so callers can retry
//! with backoff on one and circuit-break on the other.

use std::time::Duration;

use thiserror::Error;

/// Failure inside an inference engine while minting or running a predictor.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PredictorError {
    message: String,
    #[source]
    source: Option<anyhow::Error>,
}

impl PredictorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Errors produced by [`crate::engine::PredictorPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// No predictor became available within the timeout. Recoverable;
    /// callers may retry or back off.
    #[error("no predictor available within {waited:?}")]
    Exhausted { waited: Duration },

    /// The pool has been shut down.
    #[error("predictor pool is closed")]
    Closed,

    /// The engine failed to mint a new predictor instance. The reserved
    /// slot is freed; a later `acquire` will retry the mint.
    #[error("failed to create predictor")]
    CreationFailed(#[source] PredictorError),

    /// A lease was released to a pool that does not own it. A programming
    /// error, not something to handle at runtime.
    #[error("released a predictor this pool does not own")]
    InvalidRelease,
}

/// Errors produced by [`crate::storage::VectorStore`] backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Vector length does not match the collection dimension. Rejected
    /// before any mutation.
    #[error("vector has dimension {got}, collection expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Record violates a storage bound (id or metadata too long, empty id).
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Persisted collection state disagrees with the configured dimension
    /// or metric, or a stored blob cannot be decoded.
    #[error("collection corrupt: {0}")]
    Corrupt(String),

    /// Transient infrastructure failure (network, disk). Recoverable via
    /// retry with backoff; never retried silently inside the store.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Some records of a batch failed on a backend without batch atomicity.
    /// `failed` holds the index into the submitted batch and the reason.
    #[error("batch partially failed: {} succeeded, {} failed", .succeeded.len(), .failed.len())]
    PartialBatch {
        succeeded: Vec<String>,
        failed: Vec<(usize, String)>,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::BackendUnavailable(err.to_string())
    }
}
