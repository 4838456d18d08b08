//! Worker execution protocol
//!
//! A worker tests its assigned types in order against its own runtime
//! instance and returns one [`WorkerResult`] per type it reached. Workers
//! never touch the progress store.
//!
//! # Protocol (per type)
//!
//! 1. Look up the capability entry; absent types fail immediately
//! 2. Spawn or insert the example value (skipped when there is no spawn format)
//! 3. Locate the subject: query for an entity, or address the resource
//! 4. Mutate every mutatable path with each of its test values, establishing
//!    a required root variant first
//! 5. Verify each mutation (call signal, or read-back)
//!
//! The first genuine failure stops the type. A transport failure stops the
//! whole worker; so does exhausting the call budget, checked between types.
//!
//! # State
//!
//! Progress is tracked in a serializable [`WorkerState`] that is published
//! to a [`StateBoard`] at every phase change and returned in the report.

use crate::client::{IntrospectionClient, MutateRequest, MutationTarget, QueryFilter};
use crate::config::{OrchestratorConfig, VerifyMode};
use crate::error::ClientError;
use crate::recovery::{self, Attempt, Fix};
use capcheck_model::{
    Assignment, CapabilityEntry, CapabilitySnapshot, EntityId, FailureDetails, MutationKind,
    MutationPath, MutationPathInfo, Operation, RetryEvent, RetrySignature, SpawnStatus, TypeName,
    TypeOutcome, WorkerResult,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::Instrument;

/// Knobs a worker needs from the run configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerSettings {
    pub verify: VerifyMode,
    pub float_tolerance: f64,
    pub max_calls: Option<usize>,
    pub entity_placeholder: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for WorkerSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            verify: config.verify,
            float_tolerance: config.float_tolerance,
            max_calls: config.max_calls_per_worker,
            entity_placeholder: config.entity_placeholder,
        }
    }
}

/// Step a worker is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    FetchSchema,
    Spawn,
    Locate,
    Mutate { path_index: usize },
    Verify { path_index: usize },
    Done,
}

/// Inspectable worker progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerState {
    pub worker_index: usize,
    pub port: u16,
    /// Index into the assignment's type list
    pub type_index: usize,
    pub current_type: Option<TypeName>,
    #[serde(flatten)]
    pub phase: Phase,
    pub calls_made: usize,
    pub retries: usize,
    pub types_completed: usize,
}

impl WorkerState {
    #[must_use]
    pub fn new(worker_index: usize, port: u16) -> Self {
        Self {
            worker_index,
            port,
            type_index: 0,
            current_type: None,
            phase: Phase::Idle,
            calls_made: 0,
            retries: 0,
            types_completed: 0,
        }
    }
}

/// Latest published state of every worker in a batch
///
/// Also keeps each worker's finished results, so a worker task that dies
/// still hands back the types it completed.
#[derive(Debug, Clone, Default)]
pub struct StateBoard {
    states: Arc<Mutex<Vec<Option<WorkerState>>>>,
    finished: Arc<Mutex<Vec<Vec<WorkerResult>>>>,
}

impl StateBoard {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            states: Arc::new(Mutex::new(vec![None; workers])),
            finished: Arc::new(Mutex::new(vec![Vec::new(); workers])),
        }
    }

    fn publish(&self, state: &WorkerState) {
        let mut states = self.states.lock();
        if state.worker_index >= states.len() {
            states.resize(state.worker_index + 1, None);
        }
        states[state.worker_index] = Some(state.clone());
    }

    fn record(&self, worker_index: usize, result: &WorkerResult) {
        let mut finished = self.finished.lock();
        if worker_index >= finished.len() {
            finished.resize_with(worker_index + 1, Vec::new);
        }
        finished[worker_index].push(result.clone());
    }

    /// Last state a worker published
    #[must_use]
    pub fn get(&self, worker_index: usize) -> Option<WorkerState> {
        self.states.lock().get(worker_index).cloned().flatten()
    }

    /// Results a worker completed, in order
    #[must_use]
    pub fn finished(&self, worker_index: usize) -> Vec<WorkerResult> {
        self.finished
            .lock()
            .get(worker_index)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<WorkerState> {
        self.states.lock().iter().flatten().cloned().collect()
    }
}

/// Why a worker stopped before finishing its assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// The runtime instance became unreachable
    Transport { message: String },
    /// The call budget ran out
    Budget { calls: usize },
    /// The worker task died
    Crashed { message: String },
}

/// Everything a worker hands back
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub assignment: Assignment,
    pub results: Vec<WorkerResult>,
    pub state: WorkerState,
    pub aborted: Option<AbortReason>,
}

impl WorkerReport {
    /// Assigned types without a result
    pub fn unreported(&self) -> impl Iterator<Item = &TypeName> {
        self.assignment
            .type_names
            .iter()
            .filter(|name| !self.results.iter().any(|r| &r.type_name == *name))
    }
}

/// A failed call after recovery was exhausted
struct CallFailure {
    error: ClientError,
    request: Value,
}

impl CallFailure {
    fn details(&self, operation: Operation, path: Option<&str>) -> FailureDetails {
        let (request, response) = match self.error.exchange() {
            (Value::Null, response) => (self.request.clone(), response),
            exchange => exchange,
        };
        let details = FailureDetails::new(operation, self.error.to_string())
            .with_exchange(request, response);
        match path {
            Some(path) => details.at_path(path),
            None => details,
        }
    }
}

/// Genuine outcome of one type that ends testing it
enum Stop {
    Fail(FailureDetails),
    /// Fail the type and stop the worker
    Abort(FailureDetails, AbortReason),
    NotFound,
}

impl Stop {
    fn from_call(failure: &CallFailure, operation: Operation, path: Option<&str>) -> Self {
        let details = failure.details(operation, path);
        if failure.error.is_transport() {
            Stop::Abort(
                details,
                AbortReason::Transport {
                    message: failure.error.message().to_string(),
                },
            )
        } else {
            Stop::Fail(details)
        }
    }
}

/// One worker bound to one runtime instance
pub struct Worker {
    client: Arc<dyn IntrospectionClient>,
    snapshot: Arc<CapabilitySnapshot>,
    settings: WorkerSettings,
    board: StateBoard,
    state: WorkerState,
}

impl Worker {
    #[must_use]
    pub fn new(
        worker_index: usize,
        port: u16,
        client: Arc<dyn IntrospectionClient>,
        snapshot: Arc<CapabilitySnapshot>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            client,
            snapshot,
            settings,
            board: StateBoard::default(),
            state: WorkerState::new(worker_index, port),
        }
    }

    /// Publish state changes to `board`
    #[must_use]
    pub fn with_board(mut self, board: StateBoard) -> Self {
        self.board = board;
        self
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Test every assigned type, in order
    pub async fn run(self, assignment: Assignment) -> WorkerReport {
        let span = tracing::info_span!(
            "worker",
            batch = assignment.batch_number,
            worker = assignment.worker_index,
            port = assignment.port
        );
        self.run_assignment(assignment).instrument(span).await
    }

    async fn run_assignment(mut self, assignment: Assignment) -> WorkerReport {
        tracing::info!("Starting {} types", assignment.type_names.len());
        let mut results = Vec::with_capacity(assignment.type_names.len());
        let mut aborted = None;

        for (type_index, type_name) in assignment.type_names.iter().enumerate() {
            if let Some(max) = self.settings.max_calls {
                if type_index > 0 && self.state.calls_made >= max {
                    tracing::warn!(
                        calls = self.state.calls_made,
                        remaining = assignment.type_names.len() - type_index,
                        "Call budget exhausted, returning partial results"
                    );
                    aborted = Some(AbortReason::Budget {
                        calls: self.state.calls_made,
                    });
                    break;
                }
            }

            self.state.type_index = type_index;
            self.state.current_type = Some(type_name.clone());
            self.enter(Phase::FetchSchema);

            let mut result = WorkerResult::new(type_name.clone());
            match self.test_type(type_name, &mut result).await {
                Ok(()) => {
                    tracing::info!(type_name = %type_name, paths = result.mutations_passed.len(), "PASS");
                }
                Err(Stop::NotFound) => {
                    tracing::warn!(type_name = %type_name, "No entity carries this type");
                    result.outcome = TypeOutcome::ComponentNotFound;
                }
                Err(Stop::Fail(failure)) => {
                    tracing::error!(type_name = %type_name, operation = %failure.operation, "FAIL: {}", failure.message);
                    result.fail(failure);
                }
                Err(Stop::Abort(failure, reason)) => {
                    tracing::error!(type_name = %type_name, "Runtime unreachable, stopping worker: {}", failure.message);
                    result.fail(failure);
                    aborted = Some(reason);
                }
            }
            self.board.record(self.state.worker_index, &result);
            results.push(result);
            self.state.types_completed += 1;
            if aborted.is_some() {
                break;
            }
        }

        self.state.current_type = None;
        self.enter(Phase::Done);
        WorkerReport {
            assignment,
            results,
            state: self.state,
            aborted,
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.state.phase = phase;
        self.board.publish(&self.state);
    }

    async fn test_type(&mut self, type_name: &TypeName, result: &mut WorkerResult) -> Result<(), Stop> {
        let snapshot = Arc::clone(&self.snapshot);
        let Some(entry) = snapshot.get(type_name) else {
            return Err(Stop::Fail(FailureDetails::new(
                Operation::Get,
                format!("{type_name} is not in the capability snapshot"),
            )));
        };

        self.enter(Phase::Spawn);
        let spawned = self.spawn(entry, result).await?;

        if !entry.has_mutatable_paths() {
            return Ok(());
        }

        self.enter(Phase::Locate);
        let target = self.locate(entry, spawned).await?;
        if let MutationTarget::Entity(entity) = target {
            result.entity_id = Some(entity);
        }

        // Root value currently established on the subject, if known
        let mut root: Option<Value> = None;
        for (path_index, (path, info)) in entry.mutation_paths.iter().enumerate() {
            if !info.is_mutatable() {
                continue;
            }
            self.enter(Phase::Mutate { path_index });
            result.total_mutations_attempted += 1;
            self.exercise_path(entry, target, path_index, path, info, &mut root, result)
                .await?;
            result.mutations_passed.push(path.clone());
        }
        Ok(())
    }

    async fn spawn(
        &mut self,
        entry: &CapabilityEntry,
        result: &mut WorkerResult,
    ) -> Result<Option<EntityId>, Stop> {
        let operation = match entry.mutation_kind {
            MutationKind::Component => Operation::Spawn,
            MutationKind::Resource => Operation::Insert,
        };
        let constructible = entry.supported_operations.is_empty()
            || entry.supports(Operation::Spawn)
            || entry.supports(Operation::Insert);
        let Some(format) = entry.spawn_format.as_ref().filter(|_| constructible) else {
            result.spawn_status = SpawnStatus::Skipped;
            return Ok(None);
        };

        let value = self.substitute_entities(format, None, operation, None).await?;
        match self.spawn_with_recovery(entry, value, result).await {
            Ok(entity) => {
                result.spawn_status = SpawnStatus::Passed;
                Ok(entity)
            }
            Err(failure) => {
                result.spawn_status = SpawnStatus::Failed;
                Err(Stop::from_call(&failure, operation, None))
            }
        }
    }

    async fn locate(
        &mut self,
        entry: &CapabilityEntry,
        spawned: Option<EntityId>,
    ) -> Result<MutationTarget, Stop> {
        if entry.mutation_kind == MutationKind::Resource {
            return Ok(MutationTarget::Resource);
        }
        let filter = QueryFilter::with_type(entry.type_name.clone());
        let entities = self.query(&filter).await.map_err(|failure| {
            Stop::from_call(&failure, Operation::Query, None)
        })?;
        match spawned.filter(|e| entities.contains(e)).or_else(|| entities.first().copied()) {
            Some(entity) => Ok(MutationTarget::Entity(entity)),
            None => Err(Stop::NotFound),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn exercise_path(
        &mut self,
        entry: &CapabilityEntry,
        target: MutationTarget,
        path_index: usize,
        path: &str,
        info: &MutationPathInfo,
        root: &mut Option<Value>,
        result: &mut WorkerResult,
    ) -> Result<(), Stop> {
        let values = info.test_values();
        if values.is_empty() {
            return Err(Stop::Fail(
                FailureDetails::new(Operation::Mutate, "no example value for mutatable path")
                    .at_path(path),
            ));
        }
        let subject = match target {
            MutationTarget::Entity(entity) => Some(entity),
            MutationTarget::Resource => None,
        };

        if let Some(required) = info.root_example.as_ref().filter(|_| !path.is_empty()) {
            if root.as_ref() != Some(required) {
                let value = self
                    .substitute_entities(required, subject, Operation::Mutate, Some(path))
                    .await?;
                let request = MutateRequest::new(target, entry.type_name.clone(), "", value);
                self.mutate_with_recovery(request, result)
                    .await
                    .map_err(|failure| {
                        let mut stop = Stop::from_call(&failure, Operation::Mutate, Some(path));
                        if let Stop::Fail(details) | Stop::Abort(details, _) = &mut stop {
                            details.message = format!("establishing root variant: {}", details.message);
                        }
                        stop
                    })?;
                *root = Some(required.clone());
            }
        }

        for value in values {
            let value = self
                .substitute_entities(&value, subject, Operation::Mutate, Some(path))
                .await?;
            let request = MutateRequest::new(target, entry.type_name.clone(), path, value);
            let sent = self
                .mutate_with_recovery(request, result)
                .await
                .map_err(|failure| Stop::from_call(&failure, Operation::Mutate, Some(path)))?;

            if self.settings.verify == VerifyMode::ReadBack {
                self.enter(Phase::Verify { path_index });
                self.read_back(&entry.type_name, target, &sent).await?;
                self.enter(Phase::Mutate { path_index });
            }
            if path.is_empty() {
                *root = Some(sent.value);
            }
        }
        Ok(())
    }

    /// Compare the value at the mutated path with what was sent
    ///
    /// Paths that do not resolve in the read-back value fall back to the
    /// call's own signal.
    async fn read_back(
        &mut self,
        type_name: &TypeName,
        target: MutationTarget,
        sent: &MutateRequest,
    ) -> Result<(), Stop> {
        self.state.calls_made += 1;
        let current = self
            .client
            .get_field(target, type_name)
            .await
            .map_err(|error| {
                let failure = CallFailure {
                    error,
                    request: sent.to_json(),
                };
                Stop::from_call(&failure, Operation::Get, Some(&sent.path))
            })?;

        let Ok(path) = sent.path.parse::<MutationPath>() else {
            return Ok(());
        };
        let Some(actual) = path.resolve(&current) else {
            tracing::debug!(path = %sent.path, "Path not addressable in read-back, trusting call");
            return Ok(());
        };
        if values_match(&sent.value, actual, self.settings.float_tolerance) {
            Ok(())
        } else {
            Err(Stop::Fail(
                FailureDetails::new(Operation::Get, "read-back value differs from mutation")
                    .at_path(sent.path.clone())
                    .with_exchange(sent.to_json(), actual.clone()),
            ))
        }
    }

    /// Replace entity placeholders with a live entity other than `subject`
    async fn substitute_entities(
        &mut self,
        value: &Value,
        subject: Option<EntityId>,
        operation: Operation,
        path: Option<&str>,
    ) -> Result<Value, Stop> {
        let placeholder = self.settings.entity_placeholder;
        if !contains_entity(value, placeholder) {
            return Ok(value.clone());
        }
        let entities = self.query(&QueryFilter::any()).await.map_err(|failure| {
            Stop::from_call(&failure, Operation::Query, path)
        })?;
        let Some(referent) = entities.into_iter().find(|e| Some(*e) != subject) else {
            let details = FailureDetails::new(
                operation,
                "no entity other than the subject is available for an entity reference",
            );
            return Err(Stop::Fail(match path {
                Some(path) => details.at_path(path),
                None => details,
            }));
        };
        Ok(replace_entity(value, placeholder, referent))
    }

    async fn query(&mut self, filter: &QueryFilter) -> Result<Vec<EntityId>, CallFailure> {
        self.state.calls_made += 1;
        self.client.query(filter).await.map_err(|error| CallFailure {
            error,
            request: serde_json::to_value(filter).unwrap_or_default(),
        })
    }

    async fn spawn_with_recovery(
        &mut self,
        entry: &CapabilityEntry,
        mut value: Value,
        result: &mut WorkerResult,
    ) -> Result<Option<EntityId>, CallFailure> {
        let operation = match entry.mutation_kind {
            MutationKind::Component => Operation::Spawn,
            MutationKind::Resource => Operation::Insert,
        };
        let mut used = Vec::new();
        loop {
            self.state.calls_made += 1;
            let error = match self
                .client
                .spawn_or_insert(entry.mutation_kind, &entry.type_name, &value)
                .await
            {
                Ok(entity) => return Ok(entity),
                Err(error) => error,
            };
            let attempt = Attempt {
                error: &error,
                value: &value,
                order: None,
            };
            match recovery::diagnose(&attempt, &used) {
                Some(repair) => {
                    self.note_retry(result, &mut used, repair.signature, operation, None);
                    if let Fix::Value(fixed) = repair.fix {
                        value = fixed;
                    }
                }
                None => {
                    return Err(CallFailure {
                        error,
                        request: serde_json::json!({
                            "type_name": entry.type_name,
                            "value": value,
                        }),
                    })
                }
            }
        }
    }

    /// Issue a mutate call, applying at most one repair per signature
    ///
    /// Returns the request as finally accepted.
    async fn mutate_with_recovery(
        &mut self,
        mut request: MutateRequest,
        result: &mut WorkerResult,
    ) -> Result<MutateRequest, CallFailure> {
        let mut used = Vec::new();
        loop {
            self.state.calls_made += 1;
            let error = match self.client.mutate_field(&request).await {
                Ok(()) => return Ok(request),
                Err(error) => error,
            };
            let attempt = Attempt {
                error: &error,
                value: &request.value,
                order: Some(request.order),
            };
            match recovery::diagnose(&attempt, &used) {
                Some(repair) => {
                    let path = Some(request.path.clone());
                    self.note_retry(result, &mut used, repair.signature, Operation::Mutate, path);
                    match repair.fix {
                        Fix::Value(fixed) => request.value = fixed,
                        Fix::Order(order) => request.order = order,
                    }
                }
                None => {
                    return Err(CallFailure {
                        request: request.to_json(),
                        error,
                    })
                }
            }
        }
    }

    fn note_retry(
        &mut self,
        result: &mut WorkerResult,
        used: &mut Vec<RetrySignature>,
        signature: RetrySignature,
        operation: Operation,
        path: Option<String>,
    ) {
        tracing::warn!(?signature, %operation, path = path.as_deref().unwrap_or(""), "Retrying self-inflicted error");
        used.push(signature);
        self.state.retries += 1;
        result.record_retry(RetryEvent {
            signature,
            operation,
            path,
        });
    }
}

fn contains_entity(value: &Value, placeholder: u64) -> bool {
    match value {
        Value::Number(n) => n.as_u64() == Some(placeholder),
        Value::Array(items) => items.iter().any(|v| contains_entity(v, placeholder)),
        Value::Object(fields) => fields.values().any(|v| contains_entity(v, placeholder)),
        _ => false,
    }
}

fn replace_entity(value: &Value, placeholder: u64, entity: EntityId) -> Value {
    match value {
        Value::Number(n) if n.as_u64() == Some(placeholder) => Value::from(entity.0),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| replace_entity(v, placeholder, entity))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), replace_entity(v, placeholder, entity)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Structural equality with absolute tolerance on numbers
fn values_match(expected: &Value, actual: &Value, tolerance: f64) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= tolerance,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|(x, y)| values_match(x, y, tolerance))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, x)| {
                    b.get(k)
                        .is_some_and(|y| values_match(x, y, tolerance))
                })
        }
        _ => expected == actual,
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("endpoint", &self.client.endpoint())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
