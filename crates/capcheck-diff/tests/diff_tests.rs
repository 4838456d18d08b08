//! Functional tests for snapshot comparison.
//!
//! These tests exercise the comparator's contract:
//! - Comparing a snapshot with itself yields no changes.
//! - Allow-listed changes are reported but marked expected.
//! - Added, removed and modified types are counted separately.

use capcheck_diff::{AllowList, ChangeKind, Comparator, ENUM_VARIANT_QUALIFIED};
use capcheck_model::{
    CapabilityEntry, CapabilitySnapshot, MutationKind, MutationPathInfo, PathKind, TypeName,
};
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;

fn entry(i: usize, value: i64) -> CapabilityEntry {
    CapabilityEntry::new(format!("game::T{i:03}"), MutationKind::Component)
        .with_spawn_format(json!({"v": value}))
        .with_path(".v", MutationPathInfo::with_example(PathKind::StructField, json!(value)))
}

proptest! {
    /// Tenet: a snapshot compared with itself is identical, whatever it holds.
    #[test]
    fn self_comparison_is_empty(values in proptest::collection::vec(-100i64..100, 0..30)) {
        let snapshot = CapabilitySnapshot::from_entries(
            values.iter().enumerate().map(|(i, v)| entry(i, *v)),
        );
        let comparator = Comparator::new(AllowList::builtin().unwrap());
        let report = comparator.compare(&snapshot, &snapshot.clone()).unwrap();
        prop_assert!(report.is_empty());
        prop_assert!(!report.requires_review());

        let bytes = serde_json::to_vec(&snapshot).unwrap();
        prop_assert!(comparator.compare_bytes(&bytes, &bytes).unwrap().identical);
    }
}

/// Tenet: fetch metadata alone never shows up as a change.
#[test]
fn refetch_of_unchanged_registry_is_identical() {
    let base = CapabilitySnapshot::from_entries([entry(0, 1)]);
    let later = base
        .clone()
        .stamped("http://localhost:15702", Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
    let report = Comparator::default().compare(&base, &later).unwrap();
    assert!(report.identical);
}

/// Tenet: a bare enum variant that became fully qualified is expected,
/// not a regression.
#[test]
fn qualified_enum_variant_is_expected() {
    let bloom = |mode: &str| {
        CapabilityEntry::new("bevy_core_pipeline::bloom::Bloom", MutationKind::Component)
            .with_spawn_format(json!({"composite_mode": mode, "intensity": 0.15}))
            .with_path(
                ".composite_mode",
                MutationPathInfo::with_variants(
                    PathKind::StructField,
                    vec![json!(mode)],
                ),
            )
    };
    let baseline = CapabilitySnapshot::from_entries([bloom("Additive")]);
    let current = CapabilitySnapshot::from_entries([bloom("BloomCompositeMode::Additive")]);

    let report = Comparator::new(AllowList::builtin().unwrap())
        .compare(&baseline, &current)
        .unwrap();

    let diff = report
        .modified_type(&TypeName::new("bevy_core_pipeline::bloom::Bloom"))
        .unwrap();
    assert!(!diff.changes.is_empty());
    assert!(diff
        .changes
        .iter()
        .all(|c| c.kind == ChangeKind::ValueChanged
            && c.expected_by.as_deref() == Some(ENUM_VARIANT_QUALIFIED)));
    assert!(!report.requires_review());

    // Without the rule the same change needs review.
    let strict = Comparator::default().compare(&baseline, &current).unwrap();
    assert!(strict.requires_review());
}

/// Tenet: one new type and two changed types are counted as exactly that.
#[test]
fn counts_added_and_modified_types() {
    let baseline = CapabilitySnapshot::from_entries((0..50).map(|i| entry(i, 0)));
    let current = CapabilitySnapshot::from_entries((0..51).map(|i| {
        let value = if i == 3 || i == 17 { 1 } else { 0 };
        entry(i, value)
    }));

    let report = Comparator::new(AllowList::builtin().unwrap())
        .compare(&baseline, &current)
        .unwrap();
    let summary = report.summary();

    assert_eq!(summary.added, 1);
    assert_eq!(summary.removed, 0);
    assert_eq!(summary.modified, 2);
    assert_eq!(report.added, vec![TypeName::new("game::T050")]);
    assert_eq!(
        report
            .modified
            .iter()
            .map(|d| d.type_name.as_str())
            .collect::<Vec<_>>(),
        vec!["game::T003", "game::T017"]
    );
    assert!(report.requires_review());

    let rendered = serde_json::to_value(&report).unwrap();
    assert_eq!(rendered["added"], json!(["game::T050"]));
}

/// Tenet: a removed type always requires review.
#[test]
fn removed_type_requires_review() {
    let baseline = CapabilitySnapshot::from_entries([entry(0, 0), entry(1, 0)]);
    let current = CapabilitySnapshot::from_entries([entry(0, 0)]);
    let report = Comparator::default().compare(&baseline, &current).unwrap();
    assert_eq!(report.removed, vec![TypeName::new("game::T001")]);
    assert!(report.requires_review());
}
