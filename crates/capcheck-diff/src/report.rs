//! Diff reports

use capcheck_model::TypeName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of leaf-level change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Present only in current
    Added,
    /// Present only in baseline
    Removed,
    /// Same JSON type, different value
    ValueChanged,
    /// JSON type changed (e.g. string became object)
    TypeChanged,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::ValueChanged => "value_changed",
            ChangeKind::TypeChanged => "type_changed",
        };
        f.write_str(name)
    }
}

/// One changed leaf within a type's entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// JSON pointer into the type's entry, e.g. `/mutation_paths/.translation.x/example`
    pub location: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<Value>,
    /// Id of the allow-list rule that anticipates this change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_by: Option<String>,
}

impl FieldChange {
    #[inline]
    #[must_use]
    pub fn is_expected(&self) -> bool {
        self.expected_by.is_some()
    }
}

/// Per-type sub-diff for a modified type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDiff {
    pub type_name: TypeName,
    pub changes: Vec<FieldChange>,
}

impl TypeDiff {
    /// Changes not covered by any rule
    pub fn unexpected(&self) -> impl Iterator<Item = &FieldChange> {
        self.changes.iter().filter(|c| !c.is_expected())
    }

    /// Check if every change is anticipated
    #[must_use]
    pub fn is_fully_expected(&self) -> bool {
        self.unexpected().next().is_none()
    }
}

/// Outcome of comparing two snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    /// Inputs were identical and no walk was performed
    pub identical: bool,
    pub added: Vec<TypeName>,
    pub removed: Vec<TypeName>,
    pub modified: Vec<TypeDiff>,
}

/// Headline numbers of a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub expected_changes: usize,
    pub unexpected_changes: usize,
}

impl DiffReport {
    /// Trivial report for identical inputs
    #[must_use]
    pub fn identical() -> Self {
        Self {
            identical: true,
            ..Self::default()
        }
    }

    /// Check if nothing differs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> DiffSummary {
        let (expected, unexpected) = self
            .modified
            .iter()
            .flat_map(|t| t.changes.iter())
            .fold((0, 0), |(e, u), c| {
                if c.is_expected() {
                    (e + 1, u)
                } else {
                    (e, u + 1)
                }
            });
        DiffSummary {
            added: self.added.len(),
            removed: self.removed.len(),
            modified: self.modified.len(),
            expected_changes: expected,
            unexpected_changes: unexpected,
        }
    }

    /// Check if a human must review before promotion
    ///
    /// Added or removed types and any change outside the allow-list need review.
    #[must_use]
    pub fn requires_review(&self) -> bool {
        !self.added.is_empty()
            || !self.removed.is_empty()
            || self.modified.iter().any(|t| !t.is_fully_expected())
    }

    /// Sub-diff for one type
    #[must_use]
    pub fn modified_type(&self, type_name: &TypeName) -> Option<&TypeDiff> {
        self.modified.iter().find(|t| &t.type_name == type_name)
    }
}

fn render(value: Option<&Value>) -> String {
    value.map_or_else(|| "-".to_string(), Value::to_string)
}

impl fmt::Display for DiffReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes");
        }
        let summary = self.summary();
        writeln!(
            f,
            "added: {}, removed: {}, modified: {} ({} expected, {} unexpected changes)",
            summary.added,
            summary.removed,
            summary.modified,
            summary.expected_changes,
            summary.unexpected_changes
        )?;
        for name in &self.added {
            writeln!(f, "+ {name}")?;
        }
        for name in &self.removed {
            writeln!(f, "- {name}")?;
        }
        for diff in &self.modified {
            writeln!(f, "~ {}", diff.type_name)?;
            for change in &diff.changes {
                let marker = match &change.expected_by {
                    Some(rule) => format!("expected: {rule}"),
                    None => "REVIEW".to_string(),
                };
                writeln!(
                    f,
                    "    {} {}: {} -> {} [{}]",
                    change.kind,
                    change.location,
                    render(change.baseline.as_ref()),
                    render(change.current.as_ref()),
                    marker
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(expected: Option<&str>) -> FieldChange {
        FieldChange {
            location: "/spawn_format/mode".into(),
            kind: ChangeKind::ValueChanged,
            baseline: Some(json!("Additive")),
            current: Some(json!("BloomCompositeMode::Additive")),
            expected_by: expected.map(str::to_string),
        }
    }

    #[test]
    fn summary_splits_expected_and_unexpected() {
        let report = DiffReport {
            modified: vec![TypeDiff {
                type_name: TypeName::new("Bloom"),
                changes: vec![change(Some("enum-variant-qualified")), change(None)],
            }],
            ..DiffReport::default()
        };
        let summary = report.summary();
        assert_eq!(summary.modified, 1);
        assert_eq!(summary.expected_changes, 1);
        assert_eq!(summary.unexpected_changes, 1);
        assert!(report.requires_review());
    }

    #[test]
    fn fully_expected_report_needs_no_review() {
        let report = DiffReport {
            modified: vec![TypeDiff {
                type_name: TypeName::new("Bloom"),
                changes: vec![change(Some("enum-variant-qualified"))],
            }],
            ..DiffReport::default()
        };
        assert!(!report.is_empty());
        assert!(!report.requires_review());
        assert!(report.to_string().contains("expected: enum-variant-qualified"));
    }

    #[test]
    fn identical_report_renders_no_changes() {
        assert_eq!(DiffReport::identical().to_string(), "No changes\n");
    }
}
