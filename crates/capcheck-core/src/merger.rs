//! Result merger
//!
//! The only component that writes type statuses to the progress store.
//! After a batch returns, it:
//! 1. Validates each result (assigned identifier, retry ledger)
//! 2. Saves every PASS first, in one atomic save
//! 3. Asks for remediation if any type had no entity to test against
//! 4. Otherwise saves FAIL results and halts on any failure or integrity fault
//! 5. Advances when everything passed

use crate::error::CapcheckError;
use crate::worker::{AbortReason, WorkerReport};
use capcheck_model::{FailureDetails, PathStatus, SpawnStatus, TypeName, TypeRecord, WorkerResult};
use capcheck_store::ProgressStore;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// What the run loop does next
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MergeDecision {
    /// Move on to the next batch
    Advance,
    /// Add fixtures for these types, restart, and re-issue the same batch
    Remediate { missing: Vec<TypeName> },
    /// Stop the run and surface the causes
    Halt { causes: Vec<HaltCause> },
}

/// Reason the run halts
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltCause {
    /// Genuine failure reported by a worker
    Failed {
        type_name: TypeName,
        failure: FailureDetails,
    },
    /// A result that cannot be trusted
    Integrity { type_name: TypeName, reason: String },
    /// A worker died before reporting these types
    Unreported {
        worker: usize,
        types: Vec<TypeName>,
        reason: String,
    },
}

/// Result of one merge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub batch_number: u32,
    pub passed: Vec<TypeName>,
    pub failed: Vec<TypeName>,
    pub not_found: Vec<TypeName>,
    /// Types left pending because their worker stopped early
    pub deferred: Vec<TypeName>,
    pub decision: MergeDecision,
}

impl MergeOutcome {
    #[inline]
    #[must_use]
    pub fn is_halt(&self) -> bool {
        matches!(self.decision, MergeDecision::Halt { .. })
    }
}

/// Single writer of type statuses
pub struct ResultMerger {
    store: Arc<dyn ProgressStore>,
}

impl ResultMerger {
    #[must_use]
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    /// Fold one batch's reports into the store
    ///
    /// # Errors
    /// - `CapcheckError::Store` if the store cannot be loaded or saved;
    ///   PASS results saved before the failure stay saved
    pub fn merge(
        &self,
        batch_number: u32,
        reports: &[WorkerReport],
    ) -> Result<MergeOutcome, CapcheckError> {
        let mut causes = Vec::new();
        let mut deferred = Vec::new();
        let mut passes = Vec::new();
        let mut fails = Vec::new();
        let mut not_found = Vec::new();
        let mut seen = BTreeSet::new();

        for report in reports {
            let assigned: BTreeSet<&TypeName> = report.assignment.type_names.iter().collect();
            for result in &report.results {
                if let Err(reason) = check_result(result, &assigned, &mut seen) {
                    tracing::error!(type_name = %result.type_name, "Integrity fault: {}", reason);
                    causes.push(HaltCause::Integrity {
                        type_name: result.type_name.clone(),
                        reason,
                    });
                } else if result.is_pass() {
                    passes.push(result);
                } else if result.is_component_not_found() {
                    not_found.push(result.type_name.clone());
                } else {
                    fails.push(result);
                }
            }

            let unreported: Vec<TypeName> = report.unreported().cloned().collect();
            if unreported.is_empty() {
                continue;
            }
            match &report.aborted {
                Some(AbortReason::Crashed { message }) => causes.push(HaltCause::Unreported {
                    worker: report.assignment.worker_index,
                    types: unreported,
                    reason: message.clone(),
                }),
                Some(AbortReason::Transport { .. } | AbortReason::Budget { .. }) => {
                    deferred.extend(unreported);
                }
                None => causes.push(HaltCause::Unreported {
                    worker: report.assignment.worker_index,
                    types: unreported,
                    reason: "worker finished without reporting".to_string(),
                }),
            }
        }

        if !passes.is_empty() {
            let mut document = self.store.load()?;
            for result in &passes {
                match document.get_mut(&result.type_name) {
                    Some(record) => {
                        if let Err(reason) = apply_pass(record, result) {
                            tracing::error!(type_name = %result.type_name, "Integrity fault: {}", reason);
                            causes.push(HaltCause::Integrity {
                                type_name: result.type_name.clone(),
                                reason,
                            });
                        }
                    }
                    None => causes.push(HaltCause::Integrity {
                        type_name: result.type_name.clone(),
                        reason: "type has no progress record".to_string(),
                    }),
                }
            }
            self.store.save(&document)?;
        }
        let passed: Vec<TypeName> = passes
            .iter()
            .map(|r| r.type_name.clone())
            .filter(|name| {
                !causes
                    .iter()
                    .any(|c| matches!(c, HaltCause::Integrity { type_name, .. } if type_name == name))
            })
            .collect();
        tracing::info!(batch = batch_number, passed = passed.len(), "Saved passing results");

        let failed: Vec<TypeName> = fails.iter().map(|r| r.type_name.clone()).collect();

        let decision = if causes.is_empty() && !not_found.is_empty() {
            tracing::warn!(batch = batch_number, missing = ?not_found, "Types without entities, remediation needed");
            MergeDecision::Remediate {
                missing: not_found.clone(),
            }
        } else {
            if !fails.is_empty() {
                let mut document = self.store.load()?;
                for result in &fails {
                    if let Some(record) = document.get_mut(&result.type_name) {
                        apply_fail(record, result);
                    }
                }
                self.store.save(&document)?;
            }
            causes.extend(fails.iter().filter_map(|r| {
                r.failure().map(|failure| HaltCause::Failed {
                    type_name: r.type_name.clone(),
                    failure: failure.clone(),
                })
            }));
            if causes.is_empty() {
                MergeDecision::Advance
            } else {
                MergeDecision::Halt { causes }
            }
        };

        Ok(MergeOutcome {
            batch_number,
            passed,
            failed,
            not_found,
            deferred,
            decision,
        })
    }
}

fn check_result<'a>(
    result: &'a WorkerResult,
    assigned: &BTreeSet<&TypeName>,
    seen: &mut BTreeSet<&'a TypeName>,
) -> Result<(), String> {
    result.validate().map_err(|e| e.to_string())?;
    if !assigned.contains(&result.type_name) {
        return Err("result for a type not in the worker's assignment".to_string());
    }
    if !seen.insert(&result.type_name) {
        return Err("duplicate result".to_string());
    }
    if result.is_fail() && result.failure().is_none() {
        return Err("failure without details".to_string());
    }
    Ok(())
}

fn retry_notes(record: &mut TypeRecord, result: &WorkerResult) {
    for event in &result.retries {
        let at = event.path.as_deref().map(|p| format!(" at `{p}`")).unwrap_or_default();
        record.add_note(format!(
            "retried {} after {:?}{at}",
            event.operation, event.signature
        ));
    }
}

/// Apply a PASS; the record is untouched if the result does not cover it
fn apply_pass(record: &mut TypeRecord, result: &WorkerResult) -> Result<(), String> {
    let mut updated = record.clone();
    if result.spawn_status == SpawnStatus::Untested {
        return Err("pass without a spawn outcome".to_string());
    }
    updated.spawn_test_status = result.spawn_status;
    for path in &result.mutations_passed {
        let entry = updated
            .mutation_paths
            .get_mut(path)
            .ok_or_else(|| format!("passed path `{path}` is not in the record"))?;
        entry.status = PathStatus::Passed;
        entry.note = None;
    }
    let untested: Vec<&String> = updated
        .mutation_paths
        .iter()
        .filter(|(_, p)| p.status != PathStatus::Skipped && p.status != PathStatus::Passed)
        .map(|(path, _)| path)
        .collect();
    if !untested.is_empty() {
        return Err(format!("pass leaves paths unresolved: {untested:?}"));
    }
    updated.recompute_mutation_status();
    updated.check_invariants().map_err(|e| e.to_string())?;
    updated.batch_number = None;
    retry_notes(&mut updated, result);
    *record = updated;
    Ok(())
}

/// Apply a FAIL: attempted operations keep their actual outcome
fn apply_fail(record: &mut TypeRecord, result: &WorkerResult) {
    if result.spawn_status != SpawnStatus::Untested {
        record.spawn_test_status = result.spawn_status;
    }
    for path in &result.mutations_passed {
        if let Some(entry) = record.mutation_paths.get_mut(path) {
            entry.status = PathStatus::Passed;
            entry.note = None;
        }
    }
    retry_notes(record, result);
    if let Some(failure) = result.failure() {
        if let Some(entry) = failure
            .path
            .as_ref()
            .and_then(|p| record.mutation_paths.get_mut(p))
        {
            if entry.status != PathStatus::Skipped {
                entry.status = PathStatus::Failed;
                entry.note = Some(failure.message.clone());
            }
        }
        let at = failure.path.as_deref().map(|p| format!(" at `{p}`")).unwrap_or_default();
        record.add_note(format!("{} failed{at}: {}", failure.operation, failure.message));
    }
    record.recompute_mutation_status();
}

impl std::fmt::Debug for ResultMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultMerger")
            .field("store", &self.store.location())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerState;
    use capcheck_model::{
        Assignment, CapabilityEntry, CapabilitySnapshot, MutationKind, MutationPathInfo,
        MutationStatus, Operation, PathKind, RetryEvent, RetrySignature,
    };
    use capcheck_store::{MemoryStore, ProgressDocument};
    use serde_json::json;

    fn store() -> Arc<MemoryStore> {
        let snapshot = CapabilitySnapshot::from_entries(["A", "B", "C"].map(|name| {
            CapabilityEntry::new(name, MutationKind::Component)
                .with_spawn_format(json!({}))
                .with_path(".x", MutationPathInfo::with_example(PathKind::StructField, json!(1)))
                .with_path(".y", MutationPathInfo::with_example(PathKind::StructField, json!(2)))
        }));
        let mut document = ProgressDocument::from_snapshot(&snapshot);
        document.assign_batch_numbers(3).unwrap();
        Arc::new(MemoryStore::with_document(document))
    }

    fn report(results: Vec<WorkerResult>) -> WorkerReport {
        assigned(&["A", "B", "C"], results)
    }

    fn assigned(types: &[&str], results: Vec<WorkerResult>) -> WorkerReport {
        WorkerReport {
            assignment: Assignment {
                batch_number: 1,
                worker_index: 0,
                port: 15702,
                type_names: types.iter().copied().map(TypeName::new).collect(),
            },
            results,
            state: WorkerState::new(0, 15702),
            aborted: None,
        }
    }

    fn pass(name: &str) -> WorkerResult {
        let mut result = WorkerResult::new(TypeName::new(name));
        result.spawn_status = SpawnStatus::Passed;
        result.mutations_passed = vec![".x".into(), ".y".into()];
        result.total_mutations_attempted = 2;
        result
    }

    fn fail(name: &str) -> WorkerResult {
        let mut result = WorkerResult::new(TypeName::new(name));
        result.spawn_status = SpawnStatus::Passed;
        result.mutations_passed = vec![".x".into()];
        result.total_mutations_attempted = 2;
        result.fail(FailureDetails::new(Operation::Mutate, "rejected").at_path(".y"));
        result
    }

    #[test]
    fn all_pass_advances() {
        let store = store();
        let merger = ResultMerger::new(store.clone());
        let outcome = merger
            .merge(1, &[report(vec![pass("A"), pass("B"), pass("C")])])
            .unwrap();
        assert_eq!(outcome.decision, MergeDecision::Advance);
        let document = store.load().unwrap();
        assert!(document.records().all(TypeRecord::is_resolved));
        assert!(document.pending_batches().is_empty());
    }

    #[test]
    fn failure_halts_after_saving_passes() {
        let store = store();
        let merger = ResultMerger::new(store.clone());
        let outcome = merger
            .merge(1, &[report(vec![pass("A"), fail("B"), pass("C")])])
            .unwrap();
        assert!(outcome.is_halt());
        assert_eq!(outcome.failed, vec![TypeName::new("B")]);

        let document = store.load().unwrap();
        let b = document.get(&TypeName::new("B")).unwrap();
        assert_eq!(b.mutation_test_status, MutationStatus::Failed);
        assert_eq!(b.mutation_paths[".x"].status, PathStatus::Passed);
        assert_eq!(b.mutation_paths[".y"].status, PathStatus::Failed);
        assert!(document.get(&TypeName::new("A")).unwrap().is_resolved());
    }

    #[test]
    fn not_found_remediates_without_writing_failures() {
        let store = store();
        let merger = ResultMerger::new(store.clone());
        let mut missing = WorkerResult::new(TypeName::new("C"));
        missing.outcome = capcheck_model::TypeOutcome::ComponentNotFound;
        let outcome = merger
            .merge(1, &[report(vec![pass("A"), fail("B"), missing])])
            .unwrap();
        assert_eq!(
            outcome.decision,
            MergeDecision::Remediate {
                missing: vec![TypeName::new("C")]
            }
        );
        let document = store.load().unwrap();
        assert!(document.get(&TypeName::new("A")).unwrap().is_resolved());
        assert!(!document.get(&TypeName::new("B")).unwrap().has_failure());
    }

    #[test]
    fn mismatched_identifier_is_an_integrity_fault() {
        let store = store();
        let merger = ResultMerger::new(store.clone());
        let mut wrong = pass("A");
        wrong.tested_type_name = TypeName::new("a");
        let outcome = merger.merge(1, &[report(vec![wrong])]).unwrap();
        let MergeDecision::Halt { causes } = outcome.decision else {
            panic!("expected halt");
        };
        assert!(matches!(&causes[0], HaltCause::Integrity { type_name, .. } if type_name.as_str() == "A"));
        assert!(!store.load().unwrap().get(&TypeName::new("A")).unwrap().is_resolved());
    }

    #[test]
    fn unrecorded_retry_is_rejected() {
        let store = store();
        let merger = ResultMerger::new(store);
        let mut lying = pass("A");
        lying.retry_count = 1;
        let outcome = merger.merge(1, &[assigned(&["A"], vec![lying])]).unwrap();
        let MergeDecision::Halt { causes } = outcome.decision else {
            panic!("expected halt");
        };
        assert!(matches!(&causes[..], [HaltCause::Integrity { type_name, .. }] if type_name.as_str() == "A"));

        let mut honest = pass("B");
        honest.record_retry(RetryEvent {
            signature: RetrySignature::PrimitiveAsString,
            operation: Operation::Mutate,
            path: Some(".x".into()),
        });
        let store = self::store();
        let outcome = ResultMerger::new(store.clone())
            .merge(1, &[assigned(&["B"], vec![honest])])
            .unwrap();
        assert_eq!(outcome.decision, MergeDecision::Advance);
        let document = store.load().unwrap();
        let b = document.get(&TypeName::new("B")).unwrap();
        assert!(b.is_resolved());
        assert_eq!(b.notes.len(), 1);
    }

    #[test]
    fn budget_abort_defers_remaining_types() {
        let store = store();
        let merger = ResultMerger::new(store);
        let mut partial = report(vec![pass("A")]);
        partial.aborted = Some(AbortReason::Budget { calls: 50 });
        let outcome = merger.merge(1, &[partial]).unwrap();
        assert_eq!(outcome.decision, MergeDecision::Advance);
        assert_eq!(outcome.deferred, vec![TypeName::new("B"), TypeName::new("C")]);
    }

    #[test]
    fn failed_save_aborts_merge_after_passes_are_stored() {
        let store = store();
        let merger = ResultMerger::new(store.clone());
        store.fail_save_after(1);

        let err = merger
            .merge(1, &[report(vec![pass("A"), fail("B"), pass("C")])])
            .unwrap_err();

        assert!(matches!(err, CapcheckError::Store(_)));
        assert!(err.is_infrastructure());
        let document = store.load().unwrap();
        assert!(document.get(&TypeName::new("A")).unwrap().is_resolved());
        assert!(document.get(&TypeName::new("C")).unwrap().is_resolved());
        assert!(!document.get(&TypeName::new("B")).unwrap().has_failure());
    }

    #[test]
    fn failed_pass_save_is_an_error_not_an_advance() {
        let store = store();
        let merger = ResultMerger::new(store.clone());
        store.fail_next_save();

        let result = merger.merge(1, &[report(vec![pass("A"), pass("B"), pass("C")])]);

        assert!(matches!(result, Err(CapcheckError::Store(_))));
        assert!(store.load().unwrap().records().all(TypeRecord::needs_testing));
    }

    #[test]
    fn crashed_worker_keeps_finished_passes() {
        let store = store();
        let merger = ResultMerger::new(store.clone());
        let mut crashed = report(vec![pass("A")]);
        crashed.aborted = Some(AbortReason::Crashed {
            message: "task panicked".into(),
        });
        let outcome = merger.merge(1, &[crashed]).unwrap();
        let MergeDecision::Halt { causes } = outcome.decision else {
            panic!("expected halt");
        };
        assert!(matches!(
            &causes[..],
            [HaltCause::Unreported { types, .. }] if types == &[TypeName::new("B"), TypeName::new("C")]
        ));
        assert_eq!(outcome.passed, vec![TypeName::new("A")]);
        assert!(store.load().unwrap().get(&TypeName::new("A")).unwrap().is_resolved());
    }

    #[test]
    fn crashed_worker_halts() {
        let store = store();
        let merger = ResultMerger::new(store);
        let mut crashed = report(Vec::new());
        crashed.aborted = Some(AbortReason::Crashed {
            message: "task panicked".into(),
        });
        let outcome = merger.merge(1, &[crashed]).unwrap();
        assert!(outcome.is_halt());
    }
}
