//! Durable per-type progress records

use crate::capability::{CapabilityEntry, MutationKind};
use crate::error::ModelError;
use crate::ids::TypeName;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Outcome of the spawn/insert test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnStatus {
    Untested,
    Passed,
    Failed,
    /// No example format exists, so the type cannot be built whole
    Skipped,
}

/// Aggregate outcome over all mutation paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Untested,
    Passed,
    Failed,
    /// The type has no mutatable paths
    NotApplicable,
}

/// Outcome of one mutation path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    Untested,
    Passed,
    Failed,
    /// Marked structurally non-mutatable by the runtime
    Skipped,
}

/// Status and diagnostic note for one mutation path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRecord {
    pub status: PathStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PathRecord {
    #[inline]
    #[must_use]
    pub fn new(status: PathStatus) -> Self {
        Self { status, note: None }
    }

    #[inline]
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Test status of one registered type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRecord {
    pub type_name: TypeName,
    pub mutation_kind: MutationKind,
    pub spawn_test_status: SpawnStatus,
    pub mutation_test_status: MutationStatus,
    #[serde(default)]
    pub mutation_paths: IndexMap<String, PathRecord>,
    /// Scheduling metadata, recomputed at the start of every run
    #[serde(default)]
    pub batch_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl TypeRecord {
    /// Fresh record for a newly discovered type
    ///
    /// Non-mutatable paths start `skipped`, everything else `untested`.
    /// A type without a spawn format is spawn-`skipped`; a type without
    /// mutatable paths is mutation-`not_applicable`.
    #[must_use]
    pub fn from_entry(entry: &CapabilityEntry) -> Self {
        let mutation_paths: IndexMap<String, PathRecord> = entry
            .mutation_paths
            .iter()
            .map(|(path, info)| {
                let record = if info.is_mutatable() {
                    PathRecord::new(PathStatus::Untested)
                } else {
                    PathRecord::new(PathStatus::Skipped).with_note("not mutatable")
                };
                (path.clone(), record)
            })
            .collect();

        let spawn_test_status = if entry.spawn_format.is_some() {
            SpawnStatus::Untested
        } else {
            SpawnStatus::Skipped
        };

        let mut record = Self {
            type_name: entry.type_name.clone(),
            mutation_kind: entry.mutation_kind,
            spawn_test_status,
            mutation_test_status: MutationStatus::Untested,
            mutation_paths,
            batch_number: None,
            notes: Vec::new(),
        };
        record.recompute_mutation_status();
        record
    }

    /// Fully resolved records are never scheduled again until reset
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self.spawn_test_status, SpawnStatus::Passed | SpawnStatus::Skipped)
            && matches!(
                self.mutation_test_status,
                MutationStatus::Passed | MutationStatus::NotApplicable
            )
    }

    /// Eligible for batch assignment
    #[must_use]
    pub fn needs_testing(&self) -> bool {
        self.spawn_test_status == SpawnStatus::Untested
            || self.mutation_test_status == MutationStatus::Untested
    }

    /// Check if either test has failed
    #[must_use]
    pub fn has_failure(&self) -> bool {
        self.spawn_test_status == SpawnStatus::Failed
            || self.mutation_test_status == MutationStatus::Failed
    }

    /// Derive the aggregate mutation status from the per-path statuses
    pub fn recompute_mutation_status(&mut self) {
        let mut testable = self
            .mutation_paths
            .values()
            .filter(|p| p.status != PathStatus::Skipped)
            .peekable();

        self.mutation_test_status = if testable.peek().is_none() {
            MutationStatus::NotApplicable
        } else {
            let statuses: Vec<PathStatus> = testable.map(|p| p.status).collect();
            if statuses.contains(&PathStatus::Failed) {
                MutationStatus::Failed
            } else if statuses.iter().all(|s| *s == PathStatus::Passed) {
                MutationStatus::Passed
            } else {
                MutationStatus::Untested
            }
        };
    }

    /// Verify the aggregate status agrees with the path statuses
    pub fn check_invariants(&self) -> Result<(), ModelError> {
        let violation = |reason: &str| ModelError::StatusInvariant {
            type_name: self.type_name.clone(),
            reason: reason.to_string(),
        };
        let mut testable = self
            .mutation_paths
            .values()
            .filter(|p| p.status != PathStatus::Skipped);

        match self.mutation_test_status {
            MutationStatus::Passed => {
                if !testable.all(|p| p.status == PathStatus::Passed) {
                    return Err(violation("passed with a non-passed path"));
                }
            }
            MutationStatus::Failed => {
                if !testable.any(|p| p.status == PathStatus::Failed) {
                    return Err(violation("failed without a failed path"));
                }
            }
            MutationStatus::NotApplicable => {
                if testable.next().is_some() {
                    return Err(violation("not_applicable with mutatable paths"));
                }
            }
            MutationStatus::Untested => {}
        }
        Ok(())
    }

    /// Return the record to `untested`, keeping structural skips
    pub fn reset(&mut self) {
        if self.spawn_test_status != SpawnStatus::Skipped {
            self.spawn_test_status = SpawnStatus::Untested;
        }
        for path in self.mutation_paths.values_mut() {
            if path.status != PathStatus::Skipped {
                path.status = PathStatus::Untested;
                path.note = None;
            }
        }
        self.notes.clear();
        self.recompute_mutation_status();
    }

    /// Append to the diagnostic trail
    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}
