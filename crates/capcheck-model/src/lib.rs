//! capcheck data model
//!
//! Leaf types shared by every other capcheck crate.
//!
//! # Core Concepts
//!
//! - [`TypeRecord`]: Durable per-type test status, owned by the progress store
//! - [`CapabilityEntry`] / [`CapabilitySnapshot`]: Point-in-time schema data fetched
//!   from the target runtime
//! - [`MutationPath`]: Parsed dotted/bracketed address of a sub-field
//! - [`Assignment`] / [`WorkerResult`]: Ephemeral per-batch scheduling and outcome data
//!
//! # Example
//!
//! ```rust,ignore
//! use capcheck_model::{CapabilitySnapshot, TypeRecord};
//!
//! let snapshot: CapabilitySnapshot = serde_json::from_str(&json)?;
//! let records: Vec<TypeRecord> = snapshot.entries().map(TypeRecord::from_entry).collect();
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod capability;
mod error;
mod ids;
mod path;
mod record;
mod work;

pub use capability::{
    CapabilityEntry, CapabilitySnapshot, MutationKind, MutationPathInfo, Operation, PathKind,
    SnapshotDigest,
};
pub use error::ModelError;
pub use ids::{EntityId, TypeName};
pub use path::{MutationPath, PathSegment};
pub use record::{MutationStatus, PathRecord, PathStatus, SpawnStatus, TypeRecord};
pub use work::{
    Assignment, FailureDetails, RetryEvent, RetrySignature, TypeOutcome, WorkerResult,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
