//! Store errors

use capcheck_model::{ModelError, TypeName};
use std::path::PathBuf;

/// Errors from the progress store, scheduler and baseline management
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying filesystem failure
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Document exists but cannot be trusted; the run must not proceed on it
    #[error("progress store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Record invariant violated
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Document could not be encoded
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Partition request cannot cover the batch
    #[error("{workers} workers x {per_worker} types cannot cover {types} types")]
    InsufficientCapacity {
        workers: usize,
        per_worker: usize,
        types: usize,
    },

    /// Invalid scheduling parameter
    #[error("invalid scheduling parameter: {0}")]
    InvalidParameter(String),

    /// Referenced type has no record
    #[error("unknown type: {0}")]
    UnknownType(TypeName),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Check if the store's contents are unusable
    #[inline]
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}
