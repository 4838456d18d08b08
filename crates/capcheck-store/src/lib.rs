//! capcheck progress store
//!
//! Durable, atomically-written progress state and the scheduling that
//! reads it.
//!
//! # Core Concepts
//!
//! - [`ProgressDocument`]: One [`TypeRecord`](capcheck_model::TypeRecord) per type, keyed by name
//! - [`ProgressStore`]: Whole-document load/save; [`JsonFileStore`] writes via temp file + rename
//! - [`BatchScheduler`]: Next batch selection and per-worker partitioning
//! - [`BaselineManager`]: Promotion of the current store to baseline with archival
//! - [`ProgressStats`]: Summary counts
//!
//! # Example
//!
//! ```rust,ignore
//! use capcheck_store::{BatchScheduler, JsonFileStore, ProgressStore};
//!
//! let store = JsonFileStore::new("mutation_test_progress.json");
//! store.assign_batch_numbers(30, &excluded)?;
//!
//! let scheduler = BatchScheduler::new(10, 3, 30_001)?;
//! if let Some((batch, records)) = scheduler.next_batch(&store.load()?) {
//!     let names: Vec<_> = records.iter().map(|r| r.type_name.clone()).collect();
//!     let assignments = scheduler.partition(batch, &names)?;
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod baseline;
mod document;
mod error;
mod scheduler;
mod stats;
mod store;

pub use baseline::{BaselineManager, Promotion};
pub use document::{ProgressDocument, SyncReport, DOCUMENT_VERSION};
pub use error::StoreError;
pub use scheduler::{partition, BatchScheduler};
pub use stats::{ProgressStats, StatusCounts};
pub use store::{read_document, write_atomic, JsonFileStore, MemoryStore, ProgressStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
