//! Summary statistics over a progress document

use crate::document::ProgressDocument;
use capcheck_model::{MutationStatus, PathStatus, SpawnStatus, TypeName};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Counts per status value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub untested: usize,
    pub passed: usize,
    pub failed: usize,
    /// `skipped` for spawn/path statuses, `not_applicable` for mutation status
    pub skipped: usize,
}

/// Progress overview
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressStats {
    pub total_types: usize,
    pub resolved_types: usize,
    pub spawn: StatusCounts,
    pub mutation: StatusCounts,
    pub paths: StatusCounts,
    pub failed_types: Vec<TypeName>,
    pub excluded_types: Vec<TypeName>,
    pub pending_batches: usize,
}

impl ProgressStats {
    /// Compute statistics, reporting `excluded` types separately
    #[must_use]
    pub fn compute(document: &ProgressDocument, excluded: &BTreeSet<TypeName>) -> Self {
        let mut stats = Self {
            total_types: document.len(),
            pending_batches: document.pending_batches().len(),
            ..Self::default()
        };

        for record in document.records() {
            if excluded.contains(&record.type_name) {
                stats.excluded_types.push(record.type_name.clone());
            }
            if record.is_resolved() {
                stats.resolved_types += 1;
            }
            if record.has_failure() {
                stats.failed_types.push(record.type_name.clone());
            }

            match record.spawn_test_status {
                SpawnStatus::Untested => stats.spawn.untested += 1,
                SpawnStatus::Passed => stats.spawn.passed += 1,
                SpawnStatus::Failed => stats.spawn.failed += 1,
                SpawnStatus::Skipped => stats.spawn.skipped += 1,
            }
            match record.mutation_test_status {
                MutationStatus::Untested => stats.mutation.untested += 1,
                MutationStatus::Passed => stats.mutation.passed += 1,
                MutationStatus::Failed => stats.mutation.failed += 1,
                MutationStatus::NotApplicable => stats.mutation.skipped += 1,
            }
            for path in record.mutation_paths.values() {
                match path.status {
                    PathStatus::Untested => stats.paths.untested += 1,
                    PathStatus::Passed => stats.paths.passed += 1,
                    PathStatus::Failed => stats.paths.failed += 1,
                    PathStatus::Skipped => stats.paths.skipped += 1,
                }
            }
        }
        stats
    }

    /// Percentage of types fully resolved
    #[must_use]
    pub fn completion_percent(&self) -> f64 {
        if self.total_types == 0 {
            return 100.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let pct = self.resolved_types as f64 * 100.0 / self.total_types as f64;
        pct
    }
}

impl fmt::Display for ProgressStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Types: {} ({} resolved, {:.1}%)", self.total_types, self.resolved_types, self.completion_percent())?;
        writeln!(
            f,
            "  Spawn:    {} passed, {} failed, {} skipped, {} untested",
            self.spawn.passed, self.spawn.failed, self.spawn.skipped, self.spawn.untested
        )?;
        writeln!(
            f,
            "  Mutation: {} passed, {} failed, {} n/a, {} untested",
            self.mutation.passed, self.mutation.failed, self.mutation.skipped, self.mutation.untested
        )?;
        writeln!(
            f,
            "  Paths:    {} passed, {} failed, {} skipped, {} untested",
            self.paths.passed, self.paths.failed, self.paths.skipped, self.paths.untested
        )?;
        writeln!(f, "Pending batches: {}", self.pending_batches)?;
        if !self.failed_types.is_empty() {
            writeln!(f, "Failed types:")?;
            for name in &self.failed_types {
                writeln!(f, "  - {name}")?;
            }
        }
        if !self.excluded_types.is_empty() {
            writeln!(f, "Excluded types:")?;
            for name in &self.excluded_types {
                writeln!(f, "  - {name}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capcheck_model::{
        CapabilityEntry, CapabilitySnapshot, MutationKind, MutationPathInfo, PathKind,
    };
    use serde_json::json;

    #[test]
    fn counts_statuses() {
        let snapshot = CapabilitySnapshot::from_entries([
            CapabilityEntry::new("A", MutationKind::Component)
                .with_spawn_format(json!({}))
                .with_path(".x", MutationPathInfo::with_example(PathKind::StructField, json!(1)))
                .with_path(".y", MutationPathInfo::not_mutatable()),
            CapabilityEntry::new("B", MutationKind::Resource),
        ]);
        let mut document = ProgressDocument::from_snapshot(&snapshot);
        document
            .get_mut(&TypeName::new("A"))
            .unwrap()
            .spawn_test_status = SpawnStatus::Failed;

        let excluded = BTreeSet::from([TypeName::new("B")]);
        let stats = ProgressStats::compute(&document, &excluded);

        assert_eq!(stats.total_types, 2);
        assert_eq!(stats.resolved_types, 1);
        assert_eq!(stats.spawn.failed, 1);
        assert_eq!(stats.spawn.skipped, 1);
        assert_eq!(stats.paths.untested, 1);
        assert_eq!(stats.paths.skipped, 1);
        assert_eq!(stats.failed_types, vec![TypeName::new("A")]);
        assert_eq!(stats.excluded_types, vec![TypeName::new("B")]);
        assert!(stats.to_string().contains("Failed types"));
    }
}
