//! Model-level errors

use crate::ids::TypeName;

/// Errors raised while parsing or validating model data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Mutation path could not be parsed
    #[error("invalid mutation path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },

    /// A record's aggregate status disagrees with its per-path statuses
    #[error("status invariant violated for {type_name}: {reason}")]
    StatusInvariant { type_name: TypeName, reason: String },

    /// A worker reported a result under a different identifier than it was assigned
    #[error("worker tested `{tested}` but was assigned `{assigned}`")]
    IdentifierMismatch { assigned: TypeName, tested: TypeName },

    /// Retry counter disagrees with the recorded retry events
    #[error("retry accounting mismatch for {type_name}: retry_count={reported}, events={recorded}")]
    RetryAccounting {
        type_name: TypeName,
        reported: u32,
        recorded: usize,
    },

    /// Snapshot could not be serialized for digesting
    #[error("snapshot serialization failed: {0}")]
    Serialization(String),
}
