//! capcheck snapshot comparison
//!
//! Detects regressions in the runtime's capability registry by comparing
//! a baseline snapshot with a current one.
//!
//! # Core Concepts
//!
//! - [`Comparator`]: Structural walk producing added/removed/modified types
//! - [`AllowList`]: Declarative rules marking known-benign changes as expected
//! - [`DiffReport`]: Result with per-type [`FieldChange`]s and a review verdict
//!
//! # Example
//!
//! ```rust,ignore
//! use capcheck_diff::{AllowList, Comparator};
//!
//! let comparator = Comparator::new(AllowList::builtin()?);
//! let report = comparator.compare(&baseline, &current)?;
//! println!("{report}");
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod allow;
mod compare;
mod error;
mod report;

pub use allow::{AllowList, AllowRule, Condition, JsonType, Side, ENUM_VARIANT_QUALIFIED};
pub use compare::Comparator;
pub use error::DiffError;
pub use report::{ChangeKind, DiffReport, DiffSummary, FieldChange, TypeDiff};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
