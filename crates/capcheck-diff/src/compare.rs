//! Structural comparison of capability snapshots

use crate::allow::{AllowList, JsonType};
use crate::error::DiffError;
use crate::report::{ChangeKind, DiffReport, FieldChange, TypeDiff};
use capcheck_model::{CapabilitySnapshot, TypeName};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Compares two snapshots and classifies each change against an allow-list
///
/// # Example
///
/// ```rust,ignore
/// let comparator = Comparator::new(AllowList::builtin()?).ignore_field("batch_number");
/// let report = comparator.compare_bytes(&baseline, &current)?;
/// if report.requires_review() { ... }
/// ```
#[derive(Debug, Default)]
pub struct Comparator {
    allow: AllowList,
    ignored: BTreeSet<String>,
}

impl Comparator {
    #[must_use]
    pub fn new(allow: AllowList) -> Self {
        Self {
            allow,
            ignored: BTreeSet::new(),
        }
    }

    /// Skip object keys with this name at any depth
    #[must_use]
    pub fn ignore_field(mut self, name: impl Into<String>) -> Self {
        self.ignored.insert(name.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    /// Compare two in-memory snapshots
    ///
    /// Snapshots with equal digests short-circuit to an identical report.
    pub fn compare(
        &self,
        baseline: &CapabilitySnapshot,
        current: &CapabilitySnapshot,
    ) -> Result<DiffReport, DiffError> {
        if baseline.digest()? == current.digest()? {
            return Ok(DiffReport::identical());
        }
        Ok(self.compare_values(&baseline.entry_values()?, &current.entry_values()?))
    }

    /// Compare two serialized documents
    ///
    /// Accepts capability snapshots (`entries`), progress documents
    /// (`types`) or a bare object keyed by type name. Byte-identical
    /// inputs short-circuit without parsing.
    pub fn compare_bytes(&self, baseline: &[u8], current: &[u8]) -> Result<DiffReport, DiffError> {
        if baseline == current {
            return Ok(DiffReport::identical());
        }
        let baseline = type_map(baseline, "baseline")?;
        let current = type_map(current, "current")?;
        Ok(self.compare_values(&baseline, &current))
    }

    /// Compare two maps of type name to entry JSON
    #[must_use]
    pub fn compare_values(
        &self,
        baseline: &BTreeMap<TypeName, Value>,
        current: &BTreeMap<TypeName, Value>,
    ) -> DiffReport {
        let mut report = DiffReport::default();

        for (name, base) in baseline {
            match current.get(name) {
                None => report.removed.push(name.clone()),
                Some(cur) => {
                    let mut changes = Vec::new();
                    self.walk(String::new(), Some(base), Some(cur), &mut changes);
                    if !changes.is_empty() {
                        for change in &mut changes {
                            change.expected_by =
                                self.allow.expected_by(name, change).map(str::to_string);
                        }
                        report.modified.push(TypeDiff {
                            type_name: name.clone(),
                            changes,
                        });
                    }
                }
            }
        }
        report.added = current
            .keys()
            .filter(|name| !baseline.contains_key(*name))
            .cloned()
            .collect();

        tracing::debug!(
            added = report.added.len(),
            removed = report.removed.len(),
            modified = report.modified.len(),
            "Compared snapshots"
        );
        report
    }

    fn walk(
        &self,
        location: String,
        baseline: Option<&Value>,
        current: Option<&Value>,
        out: &mut Vec<FieldChange>,
    ) {
        let change = |kind| FieldChange {
            location: location.clone(),
            kind,
            baseline: baseline.cloned(),
            current: current.cloned(),
            expected_by: None,
        };

        match (baseline, current) {
            (None, None) => {}
            (Some(_), None) => out.push(change(ChangeKind::Removed)),
            (None, Some(_)) => out.push(change(ChangeKind::Added)),
            (Some(a), Some(b)) if a == b => {}
            (Some(Value::Object(a)), Some(Value::Object(b))) => {
                let keys = a.keys().chain(b.keys().filter(|k| !a.contains_key(*k)));
                for key in keys {
                    if self.ignored.contains(key) {
                        continue;
                    }
                    self.walk(
                        format!("{location}/{}", escape(key)),
                        a.get(key),
                        b.get(key),
                        out,
                    );
                }
            }
            (Some(Value::Array(a)), Some(Value::Array(b))) => {
                for i in 0..a.len().max(b.len()) {
                    self.walk(format!("{location}/{i}"), a.get(i), b.get(i), out);
                }
            }
            (Some(a), Some(b)) => {
                let kind = if JsonType::of(a) == JsonType::of(b) {
                    ChangeKind::ValueChanged
                } else {
                    ChangeKind::TypeChanged
                };
                out.push(change(kind));
            }
        }
    }
}

/// JSON pointer token escaping
fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn type_map(bytes: &[u8], what: &'static str) -> Result<BTreeMap<TypeName, Value>, DiffError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|source| DiffError::Parse { what, source })?;
    let Value::Object(mut object) = value else {
        return Err(DiffError::UnrecognizedShape { what });
    };
    let map = match (object.remove("entries"), object.remove("types")) {
        (Some(Value::Object(entries)), _) => entries,
        (None, Some(Value::Object(types))) => types,
        (None, None) => object,
        _ => return Err(DiffError::UnrecognizedShape { what }),
    };
    Ok(map.into_iter().map(|(k, v)| (TypeName::new(k), v)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> BTreeMap<TypeName, Value> {
        pairs
            .iter()
            .map(|(k, v)| (TypeName::new(*k), v.clone()))
            .collect()
    }

    #[test]
    fn walk_reports_leaf_changes() {
        let comparator = Comparator::default();
        let report = comparator.compare_values(
            &map(&[("A", json!({"a": 1, "b": [1, 2], "c": "x", "d/e": 0}))]),
            &map(&[("A", json!({"a": 2, "b": [1], "c": {"k": 1}, "d/e": 0, "n": null}))]),
        );
        let diff = report.modified_type(&TypeName::new("A")).unwrap();
        let got: Vec<(&str, ChangeKind)> = diff
            .changes
            .iter()
            .map(|c| (c.location.as_str(), c.kind))
            .collect();
        assert_eq!(
            got,
            vec![
                ("/a", ChangeKind::ValueChanged),
                ("/b/1", ChangeKind::Removed),
                ("/c", ChangeKind::TypeChanged),
                ("/n", ChangeKind::Added),
            ]
        );
    }

    #[test]
    fn ignored_fields_are_skipped() {
        let comparator = Comparator::default().ignore_field("batch_number");
        let report = comparator.compare_values(
            &map(&[("A", json!({"batch_number": 1, "s": "passed"}))]),
            &map(&[("A", json!({"batch_number": 4, "s": "passed"}))]),
        );
        assert!(report.is_empty());
        assert!(!report.identical);
    }

    #[test]
    fn pointer_tokens_are_escaped() {
        assert_eq!(escape("a/b~c"), "a~1b~0c");
    }

    #[test]
    fn byte_inputs_of_each_shape() {
        let comparator = Comparator::default();
        let same = br#"{"entries": {"A": {"x": 1}}}"#;
        assert!(comparator.compare_bytes(same, same).unwrap().identical);

        let report = comparator
            .compare_bytes(
                br#"{"version": 1, "types": {"A": {"x": 1}}}"#,
                br#"{"A": {"x": 1}, "B": {}}"#,
            )
            .unwrap();
        assert_eq!(report.added, vec![TypeName::new("B")]);
        assert!(report.modified.is_empty());

        let err = comparator.compare_bytes(b"[1]", b"{}").unwrap_err();
        assert!(matches!(err, DiffError::UnrecognizedShape { what: "baseline" }));
        let err = comparator.compare_bytes(b"{", b"{}").unwrap_err();
        assert!(matches!(err, DiffError::Parse { .. }));
    }
}
