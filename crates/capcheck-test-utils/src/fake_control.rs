//! Fake fleet and runtime control
//!
//! [`FakeFleet`] hands out one [`FakeRuntime`] per port and doubles as the
//! client factory. [`FakeRuntimeControl`] restarts those runtimes and
//! records every control action.

use crate::fake_runtime::FakeRuntime;
use async_trait::async_trait;
use capcheck_core::{
    ClientFactory, InstanceSpec, InstanceStatus, IntrospectionClient, RuntimeControl,
    RuntimeError, RuntimeInstance,
};
use capcheck_model::{CapabilitySnapshot, TypeName};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Fake runtimes on consecutive ports
#[derive(Debug)]
pub struct FakeFleet {
    runtimes: BTreeMap<u16, Arc<FakeRuntime>>,
    connections: Mutex<Vec<u16>>,
}

impl FakeFleet {
    /// `count` runtimes serving `registry`, from `base_port` up
    #[must_use]
    pub fn new(registry: &CapabilitySnapshot, base_port: u16, count: u16) -> Self {
        let runtimes = (0..count)
            .map(|offset| {
                let port = base_port + offset;
                (port, Arc::new(FakeRuntime::new(port, registry.clone())))
            })
            .collect();
        Self {
            runtimes,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Runtime on `port`
    ///
    /// # Panics
    /// If the fleet has no runtime on that port.
    #[must_use]
    pub fn runtime(&self, port: u16) -> Arc<FakeRuntime> {
        match self.runtimes.get(&port) {
            Some(runtime) => Arc::clone(runtime),
            None => panic!("no fake runtime on port {port}"),
        }
    }

    pub fn runtimes(&self) -> impl Iterator<Item = &Arc<FakeRuntime>> {
        self.runtimes.values()
    }

    /// Add the same entity to every runtime
    pub fn add_entity_everywhere(&self, components: &[(TypeName, Value)]) {
        for runtime in self.runtimes.values() {
            runtime.add_entity(components.iter().cloned());
        }
    }

    /// Ports connected to, in order
    #[must_use]
    pub fn connections(&self) -> Vec<u16> {
        self.connections.lock().clone()
    }
}

impl ClientFactory for FakeFleet {
    fn connect(&self, port: u16) -> Arc<dyn IntrospectionClient> {
        self.connections.lock().push(port);
        match self.runtimes.get(&port) {
            Some(runtime) => Arc::clone(runtime) as Arc<dyn IntrospectionClient>,
            None => Arc::new(FakeRuntime::unreachable(port)),
        }
    }
}

/// A recorded control action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Launch(u16),
    Shutdown(u16),
    Fixtures(Vec<TypeName>),
}

/// Runtime control over a [`FakeFleet`]
#[derive(Debug)]
pub struct FakeRuntimeControl {
    fleet: Arc<FakeFleet>,
    fixtures: Mutex<Vec<TypeName>>,
    events: Mutex<Vec<ControlEvent>>,
    fixtures_take_effect: bool,
    refuse_fixtures: bool,
}

impl FakeRuntimeControl {
    #[must_use]
    pub fn new(fleet: Arc<FakeFleet>) -> Self {
        Self {
            fleet,
            fixtures: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            fixtures_take_effect: true,
            refuse_fixtures: false,
        }
    }

    /// Accept fixture requests but never spawn the fixtures
    #[must_use]
    pub fn with_ineffective_fixtures(mut self) -> Self {
        self.fixtures_take_effect = false;
        self
    }

    /// Fail every fixture request
    #[must_use]
    pub fn refusing_fixtures(mut self) -> Self {
        self.refuse_fixtures = true;
        self
    }

    #[must_use]
    pub fn events(&self) -> Vec<ControlEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn fixtures(&self) -> Vec<TypeName> {
        self.fixtures.lock().clone()
    }

    /// Ports launched, in order
    #[must_use]
    pub fn launches(&self) -> Vec<u16> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ControlEvent::Launch(port) => Some(*port),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RuntimeControl for FakeRuntimeControl {
    async fn launch(
        &self,
        spec: InstanceSpec,
        count: usize,
    ) -> Result<Vec<RuntimeInstance>, RuntimeError> {
        let fixtures = if self.fixtures_take_effect {
            self.fixtures.lock().clone()
        } else {
            Vec::new()
        };
        let mut instances = Vec::with_capacity(count);
        for offset in 0..count {
            let port = u16::try_from(offset)
                .ok()
                .and_then(|offset| spec.base_port.checked_add(offset))
                .ok_or(RuntimeError::Unresponsive {
                    port: spec.base_port,
                    attempts: 0,
                })?;
            if let Some(runtime) = self.fleet.runtimes.get(&port) {
                runtime.restart(&fixtures);
            }
            self.events.lock().push(ControlEvent::Launch(port));
            instances.push(RuntimeInstance { port, pid: None });
        }
        Ok(instances)
    }

    async fn shutdown(&self, port: u16) -> Result<(), RuntimeError> {
        if let Some(runtime) = self.fleet.runtimes.get(&port) {
            runtime.set_down(true);
        }
        self.events.lock().push(ControlEvent::Shutdown(port));
        Ok(())
    }

    async fn status(&self, port: u16) -> InstanceStatus {
        match self.fleet.runtimes.get(&port) {
            Some(runtime) if runtime.is_up() => InstanceStatus::Running,
            _ => InstanceStatus::Unresponsive,
        }
    }

    async fn add_fixtures(&self, types: &[TypeName]) -> Result<(), RuntimeError> {
        if self.refuse_fixtures {
            return Err(RuntimeError::Fixture("fixtures refused".to_string()));
        }
        let mut fixtures = self.fixtures.lock();
        for name in types {
            if !fixtures.contains(name) {
                fixtures.push(name.clone());
            }
        }
        self.events.lock().push(ControlEvent::Fixtures(types.to_vec()));
        Ok(())
    }
}
