//! Functional tests for the worker execution protocol.
//!
//! Each test drives one worker against a fake runtime instance:
//! - Spawn, locate and mutate every path, in order.
//! - Self-inflicted request errors are repaired once per signature and counted.
//! - Genuine failures stop the type with the request and response attached.
//! - Transport failures and the call budget stop the whole worker.

use capcheck_core::{AbortReason, ArgumentOrder, Phase, StateBoard, VerifyMode, Worker, WorkerSettings};
use capcheck_model::{
    Assignment, CapabilityEntry, CapabilitySnapshot, MutationKind, MutationPathInfo, Operation,
    PathKind, RetrySignature, SpawnStatus, TypeName, TypeOutcome,
};
use capcheck_test_utils::{
    components, foo_entry, snapshot, spawnable_entry, transform_entry, unspawnable_entry,
    visibility_entry, FakeRuntime, FOO, TRANSFORM, VISIBILITY,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

const PORT: u16 = 30_001;

fn assignment(names: &[&str]) -> Assignment {
    Assignment {
        batch_number: 1,
        worker_index: 0,
        port: PORT,
        type_names: names.iter().map(|n| TypeName::new(*n)).collect(),
    }
}

fn worker(runtime: &Arc<FakeRuntime>, registry: &CapabilitySnapshot, settings: WorkerSettings) -> Worker {
    Worker::new(
        0,
        PORT,
        Arc::clone(runtime) as Arc<dyn capcheck_core::IntrospectionClient>,
        Arc::new(registry.clone()),
        settings,
    )
}

fn runtime(registry: &CapabilitySnapshot) -> Arc<FakeRuntime> {
    Arc::new(FakeRuntime::new(PORT, registry.clone()))
}

/// Tenet: a spawnable type whose every path mutates passes, and the runtime
/// ends up holding the last value written to each path.
#[tokio::test]
async fn transform_passes_all_three_paths() {
    let registry = snapshot([transform_entry()]);
    let runtime = runtime(&registry);
    let report = worker(&runtime, &registry, WorkerSettings::default())
        .run(assignment(&[TRANSFORM]))
        .await;

    assert!(report.aborted.is_none());
    let result = &report.results[0];
    assert!(result.is_pass(), "{result:?}");
    assert_eq!(result.spawn_status, SpawnStatus::Passed);
    assert_eq!(result.mutations_passed, vec![".translation", ".rotation", ".scale"]);
    assert_eq!(result.total_mutations_attempted, 3);
    assert_eq!(result.retry_count, 0);
    assert_eq!(
        runtime.component(TRANSFORM).unwrap()["scale"],
        json!([2.0, 2.0, 2.0])
    );
}

/// Tenet: a type without a spawn format is spawn-skipped and tested on an
/// existing entity, cycling through every root variant.
#[tokio::test]
async fn visibility_cycles_root_variants_on_existing_entity() {
    let registry = snapshot([visibility_entry()]);
    let runtime = runtime(&registry);
    let entity = runtime.add_entity(components([(VISIBILITY, json!("Inherited"))]));

    let report = worker(&runtime, &registry, WorkerSettings::default())
        .run(assignment(&[VISIBILITY]))
        .await;

    let result = &report.results[0];
    assert!(result.is_pass(), "{result:?}");
    assert_eq!(result.spawn_status, SpawnStatus::Skipped);
    assert_eq!(result.entity_id, Some(entity));

    let sent: Vec<_> = runtime
        .calls_for(VISIBILITY)
        .into_iter()
        .filter(|c| c.method == "bevy/mutate_component")
        .map(|c| c.params["value"].clone())
        .collect();
    assert_eq!(sent, vec![json!("Visible"), json!("Hidden"), json!("Inherited")]);
    assert_eq!(runtime.component(VISIBILITY), Some(json!("Inherited")));
}

/// Tenet: a quoted primitive is re-sent as native JSON exactly once, and the
/// retry is counted and recorded.
#[tokio::test]
async fn quoted_count_is_retried_as_number() {
    let registry = snapshot([foo_entry()]);
    let runtime = runtime(&registry);
    let report = worker(&runtime, &registry, WorkerSettings::default())
        .run(assignment(&[FOO]))
        .await;

    let result = &report.results[0];
    assert!(result.is_pass(), "{result:?}");
    assert_eq!(result.retry_count, 1);
    assert_eq!(result.retries[0].signature, RetrySignature::PrimitiveAsString);
    assert_eq!(result.retries[0].path.as_deref(), Some(".count"));
    assert_eq!(runtime.component(FOO), Some(json!({"count": 5})));
    assert_eq!(report.state.retries, 1);
}

/// Tenet: each signature repairs a call at most once, so a call needing two
/// different repairs succeeds with two retries.
#[tokio::test]
async fn order_and_quoting_are_repaired_independently() {
    let registry = snapshot([foo_entry()]);
    let runtime = runtime(&registry);
    runtime.accept_order(ArgumentOrder::ValueThenPath);

    let report = worker(&runtime, &registry, WorkerSettings::default())
        .run(assignment(&[FOO]))
        .await;

    let result = &report.results[0];
    assert!(result.is_pass(), "{result:?}");
    let signatures: Vec<_> = result.retries.iter().map(|r| r.signature).collect();
    assert_eq!(
        signatures,
        vec![RetrySignature::ParameterOrder, RetrySignature::PrimitiveAsString]
    );
    assert_eq!(result.retry_count, 2);
}

/// Tenet: double-quoted enum identifiers are unwrapped once per call.
#[tokio::test]
async fn double_quoted_variants_are_unwrapped() {
    let entry = CapabilityEntry::new(VISIBILITY, MutationKind::Component).with_path(
        "",
        MutationPathInfo::with_variants(
            PathKind::RootValue,
            vec![json!("\"Visible\""), json!("\"Hidden\"")],
        ),
    );
    let registry = snapshot([entry]);
    let runtime = runtime(&registry);
    runtime.add_entity(components([(VISIBILITY, json!("Inherited"))]));

    let report = worker(&runtime, &registry, WorkerSettings::default())
        .run(assignment(&[VISIBILITY]))
        .await;

    let result = &report.results[0];
    assert!(result.is_pass(), "{result:?}");
    assert_eq!(result.retry_count, 2);
    assert!(result
        .retries
        .iter()
        .all(|r| r.signature == RetrySignature::IdentifierDoubleQuoted));
    assert_eq!(runtime.component(VISIBILITY), Some(json!("Hidden")));
}

/// Tenet: a genuine rejection fails the type with the path, the request as
/// sent and the response as received; later types are still tested.
#[tokio::test]
async fn genuine_rejection_fails_with_full_context() {
    let registry = snapshot([spawnable_entry("test_app::Broken"), spawnable_entry("test_app::Fine")]);
    let runtime = runtime(&registry);
    runtime.reject_mutation("test_app::Broken", ".value", "Cannot apply value to field");

    let report = worker(&runtime, &registry, WorkerSettings::default())
        .run(assignment(&["test_app::Broken", "test_app::Fine"]))
        .await;

    assert!(report.aborted.is_none());
    let failure = report.results[0].failure().unwrap();
    assert_eq!(failure.operation, Operation::Mutate);
    assert_eq!(failure.path.as_deref(), Some(".value"));
    assert!(failure.message.contains("Cannot apply value to field"));
    assert_eq!(failure.request["path"], json!(".value"));
    assert_eq!(failure.request["value"], json!(1));
    assert_eq!(failure.response["message"], json!("Cannot apply value to field"));
    assert_eq!(report.results[0].retry_count, 0);
    assert!(report.results[1].is_pass());
}

/// Tenet: a type no entity carries is reported as missing, not as failed.
#[tokio::test]
async fn missing_entity_is_component_not_found() {
    let registry = snapshot([unspawnable_entry("test_app::Ghost")]);
    let runtime = runtime(&registry);
    let report = worker(&runtime, &registry, WorkerSettings::default())
        .run(assignment(&["test_app::Ghost"]))
        .await;

    assert_eq!(report.results[0].outcome, TypeOutcome::ComponentNotFound);
    assert_eq!(report.results[0].spawn_status, SpawnStatus::Skipped);
}

/// Tenet: losing the runtime fails the in-progress type and stops the
/// worker; untouched types are left unreported.
#[tokio::test]
async fn transport_loss_aborts_worker() {
    let registry = snapshot(["test_app::A", "test_app::B", "test_app::C"].map(spawnable_entry));
    let runtime = runtime(&registry);
    // spawn + query + mutate for the first type
    runtime.go_down_after(3);

    let report = worker(&runtime, &registry, WorkerSettings::default())
        .run(assignment(&["test_app::A", "test_app::B", "test_app::C"]))
        .await;

    assert!(matches!(report.aborted, Some(AbortReason::Transport { .. })));
    assert_eq!(report.results.len(), 2);
    assert!(report.results[0].is_pass());
    let failure = report.results[1].failure().unwrap();
    assert_eq!(failure.operation, Operation::Spawn);
    assert_eq!(report.results[1].spawn_status, SpawnStatus::Failed);
    assert_eq!(
        report.unreported().collect::<Vec<_>>(),
        vec![&TypeName::new("test_app::C")]
    );
}

/// Tenet: the call budget is checked between types and always lets the
/// first type finish.
#[tokio::test]
async fn call_budget_returns_partial_results() {
    let registry = snapshot(["test_app::A", "test_app::B"].map(spawnable_entry));
    let runtime = runtime(&registry);
    let settings = WorkerSettings {
        max_calls: Some(1),
        ..WorkerSettings::default()
    };

    let report = worker(&runtime, &registry, settings)
        .run(assignment(&["test_app::A", "test_app::B"]))
        .await;

    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].is_pass());
    assert_eq!(report.aborted, Some(AbortReason::Budget { calls: 3 }));
}

/// Tenet: read-back verification catches a write the runtime accepted but
/// never applied; trusting the call does not.
#[tokio::test]
async fn read_back_catches_ignored_write() {
    let registry = snapshot([spawnable_entry("test_app::Sticky")]);

    let runtime_a = runtime(&registry);
    runtime_a.ignore_mutation("test_app::Sticky", ".value");
    let trusted = worker(&runtime_a, &registry, WorkerSettings::default())
        .run(assignment(&["test_app::Sticky"]))
        .await;
    assert!(trusted.results[0].is_pass());

    let runtime_b = runtime(&registry);
    runtime_b.ignore_mutation("test_app::Sticky", ".value");
    let settings = WorkerSettings {
        verify: VerifyMode::ReadBack,
        ..WorkerSettings::default()
    };
    let verified = worker(&runtime_b, &registry, settings)
        .run(assignment(&["test_app::Sticky"]))
        .await;
    let failure = verified.results[0].failure().unwrap();
    assert_eq!(failure.operation, Operation::Get);
    assert_eq!(failure.path.as_deref(), Some(".value"));
    assert_eq!(failure.response, json!(0));
}

/// Tenet: read-back of applied writes passes within the float tolerance.
#[tokio::test]
async fn read_back_accepts_applied_writes() {
    let registry = snapshot([transform_entry()]);
    let runtime = runtime(&registry);
    let settings = WorkerSettings {
        verify: VerifyMode::ReadBack,
        ..WorkerSettings::default()
    };
    let report = worker(&runtime, &registry, settings)
        .run(assignment(&[TRANSFORM]))
        .await;
    assert!(report.results[0].is_pass(), "{:?}", report.results[0]);
    assert!(runtime.calls().iter().any(|c| c.method == "bevy/get"));
}

/// Tenet: entity-reference placeholders are replaced with a live entity
/// other than the one under test.
#[tokio::test]
async fn entity_placeholder_points_at_another_entity() {
    let entry = CapabilityEntry::new("test_app::Parent", MutationKind::Component)
        .with_spawn_format(json!({"target": 0}))
        .with_path(
            ".target",
            MutationPathInfo::with_example(PathKind::StructField, json!(8_589_934_670_u64)),
        );
    let registry = snapshot([entry]);
    let runtime = runtime(&registry);
    let other = runtime.add_entity(components([("test_app::Marker", json!({}))]));

    let report = worker(&runtime, &registry, WorkerSettings::default())
        .run(assignment(&["test_app::Parent"]))
        .await;

    assert!(report.results[0].is_pass(), "{:?}", report.results[0]);
    assert_eq!(
        runtime.component("test_app::Parent"),
        Some(json!({"target": other.0}))
    );
}

/// Tenet: the worker publishes its state and ends in `done` with counters
/// matching what it did.
#[tokio::test]
async fn state_is_published_to_board() {
    let registry = snapshot([transform_entry()]);
    let runtime = runtime(&registry);
    let board = StateBoard::new(1);
    let report = worker(&runtime, &registry, WorkerSettings::default())
        .with_board(board.clone())
        .run(assignment(&[TRANSFORM]))
        .await;

    let published = board.get(0).unwrap();
    assert_eq!(published, report.state);
    assert_eq!(published.phase, Phase::Done);
    assert_eq!(published.types_completed, 1);
    assert_eq!(published.calls_made, runtime.calls().len());
}

/// Tenet: a variant-gated path is preceded by a root write selecting its
/// variant, and the root is written again only when the required variant
/// changes.
#[tokio::test]
async fn root_variant_is_established_before_gated_paths() {
    const SHAPE: &str = "game::Shape";
    let circle = json!({"Circle": {"radius": 0.0}});
    let rect = json!({"Rect": {"width": 0.0, "height": 0.0}});
    let entry = CapabilityEntry::new(SHAPE, MutationKind::Component)
        .with_spawn_format(circle.clone())
        .with_path(
            ".Circle.radius",
            MutationPathInfo::with_example(PathKind::NestedPath, json!(2.0))
                .requiring_root(circle.clone()),
        )
        .with_path(
            ".Rect.width",
            MutationPathInfo::with_example(PathKind::NestedPath, json!(3.0))
                .requiring_root(rect.clone()),
        )
        .with_path(
            ".Rect.height",
            MutationPathInfo::with_example(PathKind::NestedPath, json!(4.0))
                .requiring_root(rect.clone()),
        );
    let registry = snapshot([entry]);
    let runtime = runtime(&registry);

    let report = worker(&runtime, &registry, WorkerSettings::default())
        .run(assignment(&[SHAPE]))
        .await;

    let result = &report.results[0];
    assert!(result.is_pass(), "{result:?}");
    let writes: Vec<_> = runtime
        .calls_for(SHAPE)
        .into_iter()
        .filter(|c| c.method == "bevy/mutate_component")
        .map(|c| (c.params["path"].clone(), c.params["value"].clone()))
        .collect();
    assert_eq!(
        writes,
        vec![
            (json!(""), circle),
            (json!(".Circle.radius"), json!(2.0)),
            (json!(""), rect),
            (json!(".Rect.width"), json!(3.0)),
            (json!(".Rect.height"), json!(4.0)),
        ]
    );
    assert_eq!(
        runtime.component(SHAPE),
        Some(json!({"Rect": {"width": 3.0, "height": 4.0}}))
    );
}
