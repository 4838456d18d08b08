//! In-process stand-in for one runtime instance
//!
//! Behaves like a strictly typed runtime: quoted primitives and
//! double-quoted identifiers are rejected, and mutate calls must use the
//! accepted argument order. Genuine failures, ignored writes, crashes and
//! outages are scripted per instance.

use async_trait::async_trait;
use capcheck_core::http_client::methods;
use capcheck_core::recovery::INVALID_PARAMS;
use capcheck_core::{
    ArgumentOrder, ClientError, IntrospectionClient, MutateRequest, MutationTarget, QueryFilter,
};
use capcheck_model::{
    CapabilityEntry, CapabilitySnapshot, EntityId, MutationKind, MutationPath, PathSegment,
    TypeName,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Error code for rejected calls
pub const RPC_REJECTED: i64 = -23402;

/// One call as received
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: &'static str,
    pub type_name: Option<TypeName>,
    pub params: Value,
}

#[derive(Debug, Clone, Default)]
struct Script {
    accepted_order: ArgumentOrder,
    /// (type, path) -> message; a `None` path rejects spawn/insert
    rejections: Vec<(TypeName, Option<String>, String)>,
    ignored: Vec<(TypeName, String)>,
    panics: Vec<TypeName>,
    down_after: Option<usize>,
}

impl Script {
    fn rejection(&self, type_name: &TypeName, path: Option<&str>) -> Option<String> {
        self.rejections
            .iter()
            .find(|(t, p, _)| t == type_name && p.as_deref() == path)
            .map(|(_, _, message)| message.clone())
    }
}

#[derive(Debug, Default)]
struct World {
    entities: BTreeMap<EntityId, BTreeMap<TypeName, Value>>,
    resources: BTreeMap<TypeName, Value>,
    next_entity: u64,
    down: bool,
    calls: Vec<RecordedCall>,
    restarts: usize,
}

impl World {
    fn spawn(&mut self, components: BTreeMap<TypeName, Value>) -> EntityId {
        self.next_entity += 1;
        let id = EntityId(self.next_entity);
        self.entities.insert(id, components);
        id
    }
}

/// Fake runtime instance bound to one port
#[derive(Debug)]
pub struct FakeRuntime {
    port: u16,
    endpoint: String,
    registry: CapabilitySnapshot,
    /// Entities restored on every restart
    seeded: Mutex<Vec<BTreeMap<TypeName, Value>>>,
    script: Mutex<Script>,
    world: Mutex<World>,
}

impl FakeRuntime {
    #[must_use]
    pub fn new(port: u16, registry: CapabilitySnapshot) -> Self {
        Self {
            port,
            endpoint: format!("fake://localhost:{port}"),
            registry,
            seeded: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            world: Mutex::new(World::default()),
        }
    }

    /// Instance nobody answers on
    #[must_use]
    pub fn unreachable(port: u16) -> Self {
        let runtime = Self::new(port, CapabilitySnapshot::default());
        runtime.set_down(true);
        runtime
    }

    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Add an entity that survives restarts
    pub fn add_entity<I>(&self, components: I) -> EntityId
    where
        I: IntoIterator<Item = (TypeName, Value)>,
    {
        let components: BTreeMap<TypeName, Value> = components.into_iter().collect();
        self.seeded.lock().push(components.clone());
        self.world.lock().spawn(components)
    }

    /// Reject mutations of `path` with a genuine error
    pub fn reject_mutation(&self, type_name: &str, path: &str, message: &str) {
        self.script.lock().rejections.push((
            TypeName::new(type_name),
            Some(path.to_string()),
            message.to_string(),
        ));
    }

    /// Reject spawning or inserting the type
    pub fn reject_spawn(&self, type_name: &str, message: &str) {
        self.script
            .lock()
            .rejections
            .push((TypeName::new(type_name), None, message.to_string()));
    }

    /// Accept mutations of `path` without applying them
    pub fn ignore_mutation(&self, type_name: &str, path: &str) {
        self.script
            .lock()
            .ignored
            .push((TypeName::new(type_name), path.to_string()));
    }

    /// Only accept mutate calls in `order`
    pub fn accept_order(&self, order: ArgumentOrder) {
        self.script.lock().accepted_order = order;
    }

    /// Panic while spawning the type
    pub fn panic_on_spawn(&self, type_name: &str) {
        self.script.lock().panics.push(TypeName::new(type_name));
    }

    /// Become unreachable once `calls` calls have been answered
    pub fn go_down_after(&self, calls: usize) {
        let answered = self.world.lock().calls.len();
        self.script.lock().down_after = Some(answered + calls);
    }

    pub fn set_down(&self, down: bool) {
        self.world.lock().down = down;
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        !self.world.lock().down
    }

    /// Drop all state, restore seeded entities, and spawn one entity per fixture
    pub fn restart(&self, fixtures: &[TypeName]) {
        let seeded = self.seeded.lock().clone();
        let mut world = self.world.lock();
        world.entities.clear();
        world.resources.clear();
        world.down = false;
        world.restarts += 1;
        for components in seeded {
            world.spawn(components);
        }
        for name in fixtures {
            if let Some(entry) = self.registry.get(name) {
                world.spawn(BTreeMap::from([(name.clone(), fixture_value(entry))]));
            }
        }
        self.script.lock().down_after = None;
    }

    #[must_use]
    pub fn restarts(&self) -> usize {
        self.world.lock().restarts
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.world.lock().calls.clone()
    }

    /// Calls that named `type_name`
    #[must_use]
    pub fn calls_for(&self, type_name: &str) -> Vec<RecordedCall> {
        let name = TypeName::new(type_name);
        self.world
            .lock()
            .calls
            .iter()
            .filter(|c| c.type_name.as_ref() == Some(&name))
            .cloned()
            .collect()
    }

    /// Current value of the type on the first entity carrying it
    #[must_use]
    pub fn component(&self, type_name: &str) -> Option<Value> {
        let name = TypeName::new(type_name);
        self.world
            .lock()
            .entities
            .values()
            .find_map(|components| components.get(&name).cloned())
    }

    #[must_use]
    pub fn resource(&self, type_name: &str) -> Option<Value> {
        self.world
            .lock()
            .resources
            .get(&TypeName::new(type_name))
            .cloned()
    }

    fn begin(
        &self,
        method: &'static str,
        type_name: Option<&TypeName>,
        params: &Value,
    ) -> Result<(), ClientError> {
        let mut world = self.world.lock();
        world.calls.push(RecordedCall {
            method,
            type_name: type_name.cloned(),
            params: params.clone(),
        });
        if let Some(limit) = self.script.lock().down_after {
            if world.calls.len() > limit {
                world.down = true;
            }
        }
        if world.down {
            return Err(ClientError::Transport {
                endpoint: self.endpoint.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

fn rejected(code: i64, message: impl Into<String>, params: &Value) -> ClientError {
    let message = message.into();
    ClientError::Rpc {
        code,
        response: json!({"code": code, "message": message}),
        message,
        request: params.clone(),
    }
}

/// Reject values a typed deserializer would not accept
fn check_value(value: &Value, params: &Value) -> Result<(), ClientError> {
    match value {
        Value::String(s) if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') => Err(
            rejected(RPC_REJECTED, format!("unknown variant `{s}`"), params),
        ),
        Value::String(s) => match serde_json::from_str::<Value>(s.trim()) {
            Ok(Value::String(_)) | Err(_) => Ok(()),
            Ok(native) => Err(rejected(
                RPC_REJECTED,
                format!("invalid type: string \"{s}\", expected {}", kind_of(&native)),
                params,
            )),
        },
        Value::Array(items) => items.iter().try_for_each(|v| check_value(v, params)),
        Value::Object(fields) => fields.values().try_for_each(|v| check_value(v, params)),
        _ => Ok(()),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a map",
        _ => "a value",
    }
}

/// Write `value` at `path`, adding a missing last field to an object
fn write_path(target: &mut Value, path: &MutationPath, value: Value) -> bool {
    if let Some(slot) = path.resolve_mut(target) {
        *slot = value;
        return true;
    }
    match (path.segments(), target) {
        ([PathSegment::Field(name)], Value::Object(fields)) => {
            fields.insert(name.clone(), value);
            true
        }
        _ => false,
    }
}

/// Value a fixture entity carries for a type
///
/// The spawn format when there is one, else the root example, else an
/// object built from the examples of top-level fields.
#[must_use]
pub fn fixture_value(entry: &CapabilityEntry) -> Value {
    if let Some(format) = &entry.spawn_format {
        return format.clone();
    }
    if let Some(root) = entry
        .mutation_paths
        .get("")
        .and_then(|info| info.test_values().into_iter().next())
    {
        return root;
    }
    let mut fields = Map::new();
    for (path, info) in &entry.mutation_paths {
        let Some(name) = path.strip_prefix('.').filter(|n| !n.contains(['.', '['])) else {
            continue;
        };
        if let Some(example) = info.test_values().into_iter().next() {
            fields.insert(name.to_string(), example);
        }
    }
    Value::Object(fields)
}

#[async_trait]
impl IntrospectionClient for FakeRuntime {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_types(&self) -> Result<Vec<TypeName>, ClientError> {
        self.begin(methods::LIST, None, &Value::Null)?;
        Ok(self.registry.entries.keys().cloned().collect())
    }

    async fn get_schema(&self, types: &[TypeName]) -> Result<CapabilitySnapshot, ClientError> {
        self.begin(methods::TYPE_GUIDE, None, &json!({ "types": types }))?;
        Ok(CapabilitySnapshot::from_entries(
            types.iter().filter_map(|t| self.registry.get(t).cloned()),
        ))
    }

    async fn spawn_or_insert(
        &self,
        kind: MutationKind,
        type_name: &TypeName,
        value: &Value,
    ) -> Result<Option<EntityId>, ClientError> {
        let method = match kind {
            MutationKind::Component => methods::SPAWN,
            MutationKind::Resource => methods::INSERT_RESOURCE,
        };
        let params = json!({ "type_name": type_name, "value": value });
        self.begin(method, Some(type_name), &params)?;

        let script = self.script.lock().clone();
        if script.panics.contains(type_name) {
            panic!("scripted crash while spawning {type_name}");
        }
        check_value(value, &params)?;
        if let Some(message) = script.rejection(type_name, None) {
            return Err(rejected(RPC_REJECTED, message, &params));
        }

        let mut world = self.world.lock();
        match kind {
            MutationKind::Component => Ok(Some(
                world.spawn(BTreeMap::from([(type_name.clone(), value.clone())])),
            )),
            MutationKind::Resource => {
                world.resources.insert(type_name.clone(), value.clone());
                Ok(None)
            }
        }
    }

    async fn query(&self, filter: &QueryFilter) -> Result<Vec<EntityId>, ClientError> {
        let params = serde_json::to_value(filter).unwrap_or_default();
        self.begin(methods::QUERY, filter.with.first(), &params)?;
        let world = self.world.lock();
        Ok(world
            .entities
            .iter()
            .filter(|(_, components)| {
                filter.with.iter().all(|t| components.contains_key(t))
                    && !filter.without.iter().any(|t| components.contains_key(t))
            })
            .map(|(id, _)| *id)
            .collect())
    }

    async fn mutate_field(&self, request: &MutateRequest) -> Result<(), ClientError> {
        let method = match request.target {
            MutationTarget::Entity(_) => methods::MUTATE_COMPONENT,
            MutationTarget::Resource => methods::MUTATE_RESOURCE,
        };
        let params = request.to_json();
        self.begin(method, Some(&request.type_name), &params)?;

        let script = self.script.lock().clone();
        if request.order != script.accepted_order {
            let missing = match script.accepted_order {
                ArgumentOrder::PathThenValue => "path",
                ArgumentOrder::ValueThenPath => "value",
            };
            return Err(rejected(
                INVALID_PARAMS,
                format!("Invalid params: missing field `{missing}`"),
                &params,
            ));
        }
        check_value(&request.value, &params)?;
        if let Some(message) = script.rejection(&request.type_name, Some(&request.path)) {
            return Err(rejected(RPC_REJECTED, message, &params));
        }
        if script
            .ignored
            .iter()
            .any(|(t, p)| t == &request.type_name && p == &request.path)
        {
            return Ok(());
        }

        let path: MutationPath = request
            .path
            .parse()
            .map_err(|e: capcheck_model::ModelError| rejected(RPC_REJECTED, e.to_string(), &params))?;
        let mut world = self.world.lock();
        let slot = match request.target {
            MutationTarget::Entity(entity) => world
                .entities
                .get_mut(&entity)
                .and_then(|components| components.get_mut(&request.type_name)),
            MutationTarget::Resource => world.resources.get_mut(&request.type_name),
        };
        let Some(current) = slot else {
            return Err(rejected(
                RPC_REJECTED,
                format!("Component {} not present", request.type_name),
                &params,
            ));
        };
        if write_path(current, &path, request.value.clone()) {
            Ok(())
        } else {
            Err(rejected(
                RPC_REJECTED,
                format!("path `{}` not found on {}", request.path, request.type_name),
                &params,
            ))
        }
    }

    async fn get_field(
        &self,
        target: MutationTarget,
        type_name: &TypeName,
    ) -> Result<Value, ClientError> {
        let (method, params) = match target {
            MutationTarget::Entity(entity) => (
                methods::GET,
                json!({ "entity": entity, "components": [type_name] }),
            ),
            MutationTarget::Resource => (methods::GET_RESOURCE, json!({ "resource": type_name })),
        };
        self.begin(method, Some(type_name), &params)?;
        let world = self.world.lock();
        let value = match target {
            MutationTarget::Entity(entity) => world
                .entities
                .get(&entity)
                .and_then(|components| components.get(type_name)),
            MutationTarget::Resource => world.resources.get(type_name),
        };
        value
            .cloned()
            .ok_or_else(|| rejected(RPC_REJECTED, format!("{type_name} not present"), &params))
    }
}
