//! Testing utilities for the capcheck workspace
//!
//! A fake runtime fleet standing in for real instances, plus capability
//! fixtures and a ready-wired orchestrator harness.

#![allow(missing_docs)]

mod fake_control;
mod fake_runtime;

pub use fake_control::{ControlEvent, FakeFleet, FakeRuntimeControl};
pub use fake_runtime::{fixture_value, FakeRuntime, RecordedCall, RPC_REJECTED};

use capcheck_core::{Orchestrator, OrchestratorConfig};
use capcheck_model::{
    CapabilityEntry, CapabilitySnapshot, MutationKind, MutationPathInfo, PathKind, TypeName,
};
use capcheck_store::{MemoryStore, ProgressDocument, ProgressStore};
use serde_json::{json, Value};
use std::sync::Arc;

pub const TRANSFORM: &str = "bevy_transform::components::transform::Transform";
pub const VISIBILITY: &str = "bevy_render::view::visibility::Visibility";
pub const FOO: &str = "test_app::Foo";

/// First port of test fleets
pub const TEST_BASE_PORT: u16 = 30_001;

/// Transform: spawnable, three mutatable fields
pub fn transform_entry() -> CapabilityEntry {
    CapabilityEntry::new(TRANSFORM, MutationKind::Component)
        .with_spawn_format(json!({
            "translation": [0.0, 0.0, 0.0],
            "rotation": [0.0, 0.0, 0.0, 1.0],
            "scale": [1.0, 1.0, 1.0],
        }))
        .with_path(
            ".translation",
            MutationPathInfo::with_example(PathKind::StructField, json!([1.0, 2.0, 3.0])),
        )
        .with_path(
            ".rotation",
            MutationPathInfo::with_example(PathKind::StructField, json!([0.0, 0.0, 0.707, 0.707])),
        )
        .with_path(
            ".scale",
            MutationPathInfo::with_example(PathKind::StructField, json!([2.0, 2.0, 2.0])),
        )
}

/// Visibility: no spawn format, root enum variants
pub fn visibility_entry() -> CapabilityEntry {
    CapabilityEntry::new(VISIBILITY, MutationKind::Component).with_path(
        "",
        MutationPathInfo::with_variants(
            PathKind::RootValue,
            vec![json!("Visible"), json!("Hidden"), json!("Inherited")],
        ),
    )
}

/// Foo: its `.count` example is a quoted number
pub fn foo_entry() -> CapabilityEntry {
    CapabilityEntry::new(FOO, MutationKind::Component)
        .with_spawn_format(json!({"count": 0}))
        .with_path(
            ".count",
            MutationPathInfo::with_example(PathKind::StructField, json!("5")),
        )
}

/// Spawnable component with one `.value` field
pub fn spawnable_entry(name: &str) -> CapabilityEntry {
    CapabilityEntry::new(name, MutationKind::Component)
        .with_spawn_format(json!({"value": 0}))
        .with_path(
            ".value",
            MutationPathInfo::with_example(PathKind::StructField, json!(1)),
        )
}

/// Component with no spawn format; testable only where an entity carries it
pub fn unspawnable_entry(name: &str) -> CapabilityEntry {
    CapabilityEntry::new(name, MutationKind::Component).with_path(
        ".value",
        MutationPathInfo::with_example(PathKind::StructField, json!(1)),
    )
}

pub fn resource_entry(name: &str) -> CapabilityEntry {
    CapabilityEntry::new(name, MutationKind::Resource)
        .with_spawn_format(json!({"level": 1}))
        .with_path(
            ".level",
            MutationPathInfo::with_example(PathKind::StructField, json!(2)),
        )
}

/// Name of the `i`-th numbered test type
pub fn numbered(i: usize) -> String {
    format!("test_app::T{i:03}")
}

/// `n` spawnable types named by [`numbered`]
pub fn numbered_entries(n: usize) -> Vec<CapabilityEntry> {
    (0..n).map(|i| spawnable_entry(&numbered(i))).collect()
}

pub fn snapshot(entries: impl IntoIterator<Item = CapabilityEntry>) -> CapabilitySnapshot {
    CapabilitySnapshot::from_entries(entries)
}

/// Configuration for a fake fleet of `workers` x `types_per_worker`
pub fn test_config(workers: usize, types_per_worker: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new()
        .with_base_port(TEST_BASE_PORT)
        .with_workers(workers)
        .with_types_per_worker(types_per_worker)
        .with_batch_size(workers * types_per_worker);
    config.runtime.startup_probes = 3;
    config.runtime.probe_interval_ms = 1;
    config
}

/// Orchestrator wired to a fake fleet and an in-memory store
pub struct Harness {
    pub config: OrchestratorConfig,
    pub store: Arc<MemoryStore>,
    pub fleet: Arc<FakeFleet>,
    pub control: Arc<FakeRuntimeControl>,
}

impl Harness {
    /// One fake runtime per worker, each serving `registry`
    pub fn new(registry: &CapabilitySnapshot, config: OrchestratorConfig) -> Self {
        let count = u16::try_from(config.worker_count).unwrap();
        let fleet = Arc::new(FakeFleet::new(registry, config.base_port, count));
        let control = Arc::new(FakeRuntimeControl::new(Arc::clone(&fleet)));
        Self {
            config,
            store: Arc::new(MemoryStore::new()),
            fleet,
            control,
        }
    }

    /// Replace the runtime control, e.g. with a refusing one
    pub fn with_control(mut self, control: FakeRuntimeControl) -> Self {
        self.control = Arc::new(control);
        self
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.config.clone(),
            Arc::clone(&self.store) as Arc<dyn ProgressStore>,
            Arc::clone(&self.fleet) as Arc<dyn capcheck_core::ClientFactory>,
            Arc::clone(&self.control) as Arc<dyn capcheck_core::RuntimeControl>,
        )
        .unwrap()
    }

    /// Runtime owned by worker `index`
    pub fn runtime(&self, index: u16) -> Arc<FakeRuntime> {
        self.fleet.runtime(self.config.base_port + index)
    }

    pub fn document(&self) -> ProgressDocument {
        self.store.load().unwrap()
    }

    /// Record of `name` in the store
    pub fn record(&self, name: &str) -> capcheck_model::TypeRecord {
        self.document().get(&TypeName::new(name)).unwrap().clone()
    }
}

/// Component list for [`FakeRuntime::add_entity`]
pub fn components<const N: usize>(items: [(&str, Value); N]) -> Vec<(TypeName, Value)> {
    items
        .into_iter()
        .map(|(name, value)| (TypeName::new(name), value))
        .collect()
}
