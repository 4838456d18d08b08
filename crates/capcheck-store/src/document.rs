//! The progress document: one record per type, keyed by type name
//!
//! Records keep first-seen order, which is the order batch numbers are
//! handed out in.

use crate::error::StoreError;
use capcheck_model::{CapabilitySnapshot, PathRecord, PathStatus, TypeName, TypeRecord};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Current on-disk format version
pub const DOCUMENT_VERSION: u32 = 1;

fn current_version() -> u32 {
    DOCUMENT_VERSION
}

/// What changed when a document was synced with a fresh snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Types seen for the first time
    pub added: Vec<TypeName>,
    /// Records whose type no longer appears in the registry
    pub missing_from_registry: Vec<TypeName>,
    /// Existing records whose path catalogue changed
    pub paths_changed: Vec<TypeName>,
}

/// Complete progress state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDocument {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub types: IndexMap<TypeName, TypeRecord>,
}

impl Default for ProgressDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            types: IndexMap::new(),
        }
    }
}

impl ProgressDocument {
    /// Create an empty document
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from records, preserving their order
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = TypeRecord>) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            types: records
                .into_iter()
                .map(|r| (r.type_name.clone(), r))
                .collect(),
        }
    }

    /// Initial document for a freshly fetched snapshot
    #[must_use]
    pub fn from_snapshot(snapshot: &CapabilitySnapshot) -> Self {
        Self::from_records(snapshot.entries().map(TypeRecord::from_entry))
    }

    #[inline]
    pub fn records(&self) -> impl Iterator<Item = &TypeRecord> {
        self.types.values()
    }

    #[inline]
    #[must_use]
    pub fn get(&self, type_name: &TypeName) -> Option<&TypeRecord> {
        self.types.get(type_name)
    }

    #[inline]
    pub fn get_mut(&mut self, type_name: &TypeName) -> Option<&mut TypeRecord> {
        self.types.get_mut(type_name)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Check structural consistency after loading
    ///
    /// Any violation marks the document corrupt rather than partially usable.
    pub fn validate(&self, origin: &Path) -> Result<(), StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            path: origin.to_path_buf(),
            reason,
        };
        if self.version != DOCUMENT_VERSION {
            return Err(corrupt(format!("unsupported version {}", self.version)));
        }
        for (key, record) in &self.types {
            if *key != record.type_name {
                return Err(corrupt(format!(
                    "key `{key}` holds record for `{}`",
                    record.type_name
                )));
            }
            record
                .check_invariants()
                .map_err(|e| corrupt(e.to_string()))?;
        }
        Ok(())
    }

    /// Drop every batch number
    pub fn clear_batch_numbers(&mut self) {
        for record in self.types.values_mut() {
            record.batch_number = None;
        }
    }

    /// Assign fresh batch numbers to every record that still needs testing
    ///
    /// Always clears first, so calling twice with no status change in
    /// between yields the same partition. Batches are numbered from 1 and
    /// filled in document order.
    pub fn assign_batch_numbers(
        &mut self,
        batch_size: usize,
    ) -> Result<IndexMap<TypeName, u32>, StoreError> {
        self.assign_batch_numbers_excluding(batch_size, &BTreeSet::new())
    }

    /// As [`Self::assign_batch_numbers`], never scheduling `excluded` types
    pub fn assign_batch_numbers_excluding(
        &mut self,
        batch_size: usize,
        excluded: &BTreeSet<TypeName>,
    ) -> Result<IndexMap<TypeName, u32>, StoreError> {
        if batch_size == 0 {
            return Err(StoreError::InvalidParameter(
                "batch size must be non-zero".to_string(),
            ));
        }
        self.clear_batch_numbers();

        let mut assigned = IndexMap::new();
        let eligible = self
            .types
            .values_mut()
            .filter(|r| r.needs_testing() && !excluded.contains(&r.type_name));

        for (position, record) in eligible.enumerate() {
            let batch = u32::try_from(position / batch_size + 1).map_err(|_| {
                StoreError::InvalidParameter("batch number overflow".to_string())
            })?;
            record.batch_number = Some(batch);
            assigned.insert(record.type_name.clone(), batch);
        }
        Ok(assigned)
    }

    /// Distinct batch numbers currently assigned
    #[must_use]
    pub fn pending_batches(&self) -> BTreeSet<u32> {
        self.types.values().filter_map(|r| r.batch_number).collect()
    }

    /// Records in a batch, in document order
    #[must_use]
    pub fn batch(&self, batch_number: u32) -> Vec<&TypeRecord> {
        self.types
            .values()
            .filter(|r| r.batch_number == Some(batch_number))
            .collect()
    }

    /// Return records to `untested`
    ///
    /// With `failed_only`, only records carrying a failure are reset.
    /// Returns the number of records reset.
    pub fn reset(&mut self, failed_only: bool) -> usize {
        let mut count = 0;
        for record in self.types.values_mut() {
            if !failed_only || record.has_failure() {
                record.reset();
                count += 1;
            }
        }
        count
    }

    /// Bring the document in line with a freshly fetched snapshot
    ///
    /// New types get fresh records. Existing records keep their statuses;
    /// newly catalogued paths are added `untested` and paths that vanished
    /// are dropped. Records for types absent from the registry are kept.
    pub fn sync_with_snapshot(&mut self, snapshot: &CapabilitySnapshot) -> SyncReport {
        let mut report = SyncReport::default();

        for entry in snapshot.entries() {
            match self.types.get_mut(&entry.type_name) {
                None => {
                    self.types
                        .insert(entry.type_name.clone(), TypeRecord::from_entry(entry));
                    report.added.push(entry.type_name.clone());
                }
                Some(record) => {
                    if sync_paths(record, entry) {
                        report.paths_changed.push(entry.type_name.clone());
                    }
                }
            }
        }

        let known: HashSet<&TypeName> = snapshot.entries.keys().collect();
        report.missing_from_registry = self
            .types
            .keys()
            .filter(|name| !known.contains(name))
            .cloned()
            .collect();

        report
    }
}

fn sync_paths(record: &mut TypeRecord, entry: &capcheck_model::CapabilityEntry) -> bool {
    let fresh = TypeRecord::from_entry(entry);
    let before: Vec<&String> = record.mutation_paths.keys().collect();
    let after: Vec<&String> = fresh.mutation_paths.keys().collect();
    if before == after {
        return false;
    }

    let mut merged: IndexMap<String, PathRecord> = IndexMap::new();
    for (path, initial) in fresh.mutation_paths {
        let kept = record
            .mutation_paths
            .get(&path)
            .filter(|existing| (existing.status == PathStatus::Skipped) == (initial.status == PathStatus::Skipped))
            .cloned();
        merged.insert(path, kept.unwrap_or(initial));
    }
    record.mutation_paths = merged;
    record.recompute_mutation_status();
    record.add_note("path catalogue changed since last run");
    true
}
