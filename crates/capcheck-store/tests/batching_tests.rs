//! Functional tests for batch assignment and scheduling.
//!
//! These tests exercise the scheduling contract of the progress store:
//! - Re-batching is idempotent and total.
//! - Resolved records never come back into scheduling.
//! - The scheduler walks batches lowest-first and slices them per worker.

use capcheck_model::{
    CapabilityEntry, CapabilitySnapshot, MutationKind, MutationPathInfo, PathKind, PathStatus,
    SpawnStatus, TypeName,
};
use capcheck_store::{BatchScheduler, JsonFileStore, ProgressDocument, ProgressStore};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;

/// Helper: snapshot with `n` spawnable component types, one path each.
fn snapshot(n: usize) -> CapabilitySnapshot {
    CapabilitySnapshot::from_entries((0..n).map(|i| {
        CapabilityEntry::new(format!("game::T{i:03}"), MutationKind::Component)
            .with_spawn_format(json!({"v": i}))
            .with_path(".v", MutationPathInfo::with_example(PathKind::StructField, json!(7)))
    }))
}

/// Helper: mark a record fully passed.
fn resolve(document: &mut ProgressDocument, name: &TypeName) {
    let record = document.get_mut(name).unwrap();
    record.spawn_test_status = SpawnStatus::Passed;
    for path in record.mutation_paths.values_mut() {
        path.status = PathStatus::Passed;
    }
    record.recompute_mutation_status();
}

proptest! {
    /// Tenet: assigning batch numbers twice with no status change in between
    /// yields the same partition.
    #[test]
    fn rebatching_is_idempotent(
        n in 0usize..80,
        batch_size in 1usize..25,
        resolved in proptest::collection::vec(any::<bool>(), 80),
    ) {
        let mut document = ProgressDocument::from_snapshot(&snapshot(n));
        let names: Vec<TypeName> = document.records().map(|r| r.type_name.clone()).collect();
        for (name, done) in names.iter().zip(resolved.iter()) {
            if *done {
                resolve(&mut document, name);
            }
        }

        let first = document.assign_batch_numbers(batch_size).unwrap();
        let snapshot_after_first = document.clone();
        let second = document.assign_batch_numbers(batch_size).unwrap();

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(snapshot_after_first, document.clone());

        // Totality: every unresolved record got a number, no resolved one did.
        for record in document.records() {
            prop_assert_eq!(record.batch_number.is_some(), record.needs_testing());
        }
    }
}

/// Tenet: the scheduler always serves the lowest pending batch, and
/// finishing a batch moves it on to the next after re-assignment.
#[test]
fn scheduler_walks_batches_in_order() {
    let mut document = ProgressDocument::from_snapshot(&snapshot(5));
    document.assign_batch_numbers(2).unwrap();

    let scheduler = BatchScheduler::new(2, 1, 40_000).unwrap();
    let (batch, records) = scheduler.next_batch(&document).unwrap();
    assert_eq!(batch, 1);
    assert_eq!(records.len(), 2);

    for record in &records {
        resolve(&mut document, &record.type_name);
    }
    document.assign_batch_numbers(2).unwrap();

    let (batch, records) = scheduler.next_batch(&document).unwrap();
    assert_eq!(batch, 1, "re-assignment renumbers from 1");
    assert_eq!(records[0].type_name, TypeName::new("game::T002"));

    let names: Vec<TypeName> = records.iter().map(|r| r.type_name.clone()).collect();
    let assignments = scheduler.partition(batch, &names).unwrap();
    assert_eq!(assignments.len(), 2);
    assert_eq!(assignments[1].port, 40_001);
}

/// Tenet: a fully resolved store yields no batch at all.
#[test]
fn resolved_store_has_no_next_batch() {
    let mut document = ProgressDocument::from_snapshot(&snapshot(3));
    let names: Vec<TypeName> = document.records().map(|r| r.type_name.clone()).collect();
    for name in &names {
        resolve(&mut document, name);
    }
    let assigned = document.assign_batch_numbers(10).unwrap();
    assert!(assigned.is_empty());

    let scheduler = BatchScheduler::new(1, 10, 40_000).unwrap();
    assert!(scheduler.next_batch(&document).is_none());
}

/// Tenet: batch assignment through the file store survives a reload.
#[test]
fn file_store_assignment_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("progress.json"));
    store
        .save(&ProgressDocument::from_snapshot(&snapshot(4)))
        .unwrap();

    let excluded = BTreeSet::from([TypeName::new("game::T000")]);
    let assigned = store.assign_batch_numbers(2, &excluded).unwrap();
    assert_eq!(assigned.len(), 3);

    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.get(&TypeName::new("game::T000")).unwrap().batch_number, None);
    assert_eq!(reloaded.pending_batches(), BTreeSet::from([1, 2]));
}
