//! Capability snapshots
//!
//! A [`CapabilitySnapshot`] is the point-in-time set of per-type spawn
//! formats and mutation-path catalogues fetched from a running instance.
//! Snapshots are immutable once fetched; the orchestrator reads them and
//! the diff comparator compares two of them.

use crate::error::ModelError;
use crate::ids::TypeName;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Remote operation a type supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Query,
    Get,
    Spawn,
    Insert,
    Mutate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Query => "query",
            Operation::Get => "get",
            Operation::Spawn => "spawn",
            Operation::Insert => "insert",
            Operation::Mutate => "mutate",
        };
        f.write_str(name)
    }
}

/// Which verb family applies to a type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    /// Lives on entities: spawn/insert, query, mutate component
    Component,
    /// Global singleton: insert resource, mutate resource
    Resource,
}

/// Structural classification of a mutation path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathKind {
    RootValue,
    StructField,
    NestedPath,
    ArrayElement,
    TupleElement,
    NotMutatable,
}

// A present `null` is a real example (e.g. `Option::None`), so keep it
// distinct from an absent key.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Example data for one mutation path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationPathInfo {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_variants: Option<Vec<Value>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub example_some: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub example_none: Option<Value>,
    /// Root value that must be in place before this path exists (enum variant paths)
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub root_example: Option<Value>,
    pub path_kind: PathKind,
}

impl MutationPathInfo {
    /// Path with a single example value
    #[must_use]
    pub fn with_example(path_kind: PathKind, example: Value) -> Self {
        Self {
            example: Some(example),
            enum_variants: None,
            example_some: None,
            example_none: None,
            root_example: None,
            path_kind,
        }
    }

    /// Path cycling through enum variants
    #[must_use]
    pub fn with_variants(path_kind: PathKind, variants: Vec<Value>) -> Self {
        Self {
            example: None,
            enum_variants: Some(variants),
            example_some: None,
            example_none: None,
            root_example: None,
            path_kind,
        }
    }

    /// Path the runtime reports as structurally non-mutatable
    #[must_use]
    pub fn not_mutatable() -> Self {
        Self {
            example: None,
            enum_variants: None,
            example_some: None,
            example_none: None,
            root_example: None,
            path_kind: PathKind::NotMutatable,
        }
    }

    /// Require a root variant before this path is mutated
    #[must_use]
    pub fn requiring_root(mut self, root_example: Value) -> Self {
        self.root_example = Some(root_example);
        self
    }

    #[inline]
    #[must_use]
    pub fn is_mutatable(&self) -> bool {
        self.path_kind != PathKind::NotMutatable
    }

    /// Values to send when exercising this path, in order
    ///
    /// Enum variants take precedence, then the `Some`/`None` pair, then
    /// the plain example. Empty when the catalogue has no usable example.
    #[must_use]
    pub fn test_values(&self) -> Vec<Value> {
        if let Some(variants) = self.enum_variants.as_ref().filter(|v| !v.is_empty()) {
            return variants.clone();
        }
        if self.example_some.is_some() || self.example_none.is_some() {
            return self
                .example_some
                .iter()
                .chain(self.example_none.iter())
                .cloned()
                .collect();
        }
        self.example.iter().cloned().collect()
    }
}

/// Schema-derived capability data for one type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEntry {
    pub type_name: TypeName,
    pub mutation_kind: MutationKind,
    #[serde(default)]
    pub supported_operations: BTreeSet<Operation>,
    /// Example value for spawn/insert; `None` when the type cannot be built whole
    #[serde(default)]
    pub spawn_format: Option<Value>,
    #[serde(default)]
    pub mutation_paths: IndexMap<String, MutationPathInfo>,
}

impl CapabilityEntry {
    /// Create an entry with no operations or paths
    #[must_use]
    pub fn new(type_name: impl Into<TypeName>, mutation_kind: MutationKind) -> Self {
        Self {
            type_name: type_name.into(),
            mutation_kind,
            supported_operations: BTreeSet::new(),
            spawn_format: None,
            mutation_paths: IndexMap::new(),
        }
    }

    /// With supported operations
    #[must_use]
    pub fn with_operations(mut self, ops: impl IntoIterator<Item = Operation>) -> Self {
        self.supported_operations.extend(ops);
        self
    }

    /// With spawn format
    #[must_use]
    pub fn with_spawn_format(mut self, format: Value) -> Self {
        self.spawn_format = Some(format);
        self
    }

    /// With an additional mutation path
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>, info: MutationPathInfo) -> Self {
        self.mutation_paths.insert(path.into(), info);
        self
    }

    #[inline]
    #[must_use]
    pub fn supports(&self, op: Operation) -> bool {
        self.supported_operations.contains(&op)
    }

    /// Paths that are not marked `NotMutatable`, in catalogue order
    pub fn mutatable_paths(&self) -> impl Iterator<Item = (&String, &MutationPathInfo)> {
        self.mutation_paths.iter().filter(|(_, info)| info.is_mutatable())
    }

    /// Check if the type has anything to mutate
    #[must_use]
    pub fn has_mutatable_paths(&self) -> bool {
        self.mutatable_paths().next().is_some()
    }
}

/// Content digest of a snapshot's entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotDigest(blake3::Hash);

impl fmt::Display for SnapshotDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

/// Point-in-time mapping from type name to capability entry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub entries: BTreeMap<TypeName, CapabilityEntry>,
}

impl CapabilitySnapshot {
    /// Build a snapshot from entries
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = CapabilityEntry>) -> Self {
        Self {
            fetched_at: None,
            source: None,
            entries: entries
                .into_iter()
                .map(|e| (e.type_name.clone(), e))
                .collect(),
        }
    }

    /// Stamp fetch time and source endpoint
    #[must_use]
    pub fn stamped(mut self, source: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.source = Some(source.into());
        self.fetched_at = Some(at);
        self
    }

    #[inline]
    #[must_use]
    pub fn get(&self, type_name: &TypeName) -> Option<&CapabilityEntry> {
        self.entries.get(type_name)
    }

    #[inline]
    pub fn entries(&self) -> impl Iterator<Item = &CapabilityEntry> {
        self.entries.values()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Digest over the canonical serialization of the entries
    ///
    /// Fetch metadata is excluded, so two fetches of an unchanged
    /// runtime digest identically.
    pub fn digest(&self) -> Result<SnapshotDigest, ModelError> {
        let bytes = serde_json::to_vec(&self.entries)
            .map_err(|e| ModelError::Serialization(e.to_string()))?;
        Ok(SnapshotDigest(blake3::hash(&bytes)))
    }

    /// Entries as raw JSON values keyed by type name, for structural diffing
    pub fn entry_values(&self) -> Result<BTreeMap<TypeName, Value>, ModelError> {
        self.entries
            .iter()
            .map(|(name, entry)| {
                serde_json::to_value(entry)
                    .map(|v| (name.clone(), v))
                    .map_err(|e| ModelError::Serialization(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn transform() -> CapabilityEntry {
        CapabilityEntry::new("Transform", MutationKind::Component)
            .with_operations([Operation::Spawn, Operation::Mutate, Operation::Query])
            .with_spawn_format(json!({"translation": [0.0, 0.0, 0.0]}))
            .with_path(".translation", MutationPathInfo::with_example(PathKind::StructField, json!([1.0, 2.0, 3.0])))
            .with_path(".translation.x", MutationPathInfo::with_example(PathKind::NestedPath, json!(1.0)))
            .with_path(".computed", MutationPathInfo::not_mutatable())
    }

    #[test]
    fn mutatable_paths_skip_not_mutatable() {
        let entry = transform();
        let paths: Vec<_> = entry.mutatable_paths().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec![".translation", ".translation.x"]);
    }

    #[test]
    fn test_values_prefer_variants() {
        let info = MutationPathInfo::with_variants(
            PathKind::RootValue,
            vec![json!("Visible"), json!("Hidden"), json!("Inherited")],
        );
        assert_eq!(info.test_values().len(), 3);
    }

    #[test]
    fn explicit_null_example_is_kept() {
        let info: MutationPathInfo = serde_json::from_value(json!({
            "example_some": 3,
            "example_none": null,
            "path_kind": "StructField"
        }))
        .unwrap();
        assert_eq!(info.test_values(), vec![json!(3), Value::Null]);
    }

    #[test]
    fn digest_ignores_fetch_metadata() {
        let a = CapabilitySnapshot::from_entries([transform()]);
        let b = a.clone().stamped("localhost:15702", Utc::now());
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn digest_changes_with_content() {
        let a = CapabilitySnapshot::from_entries([transform()]);
        let b = CapabilitySnapshot::from_entries([transform().with_path(
            ".scale",
            MutationPathInfo::with_example(PathKind::StructField, json!([1.0, 1.0, 1.0])),
        )]);
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }
}
