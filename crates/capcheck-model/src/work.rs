//! Ephemeral per-batch data: assignments handed to workers and the
//! results they hand back.

use crate::capability::Operation;
use crate::error::ModelError;
use crate::ids::{EntityId, TypeName};
use crate::record::SpawnStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Work handed to exactly one worker for one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub batch_number: u32,
    pub worker_index: usize,
    /// Port of the runtime instance owned by this worker
    pub port: u16,
    pub type_names: Vec<TypeName>,
}

/// Self-inflicted request errors that earn exactly one retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrySignature {
    /// A number, bool, array or object was sent as a quoted string
    PrimitiveAsString,
    /// An identifier string carried an extra layer of quotes
    IdentifierDoubleQuoted,
    /// The call was rejected for argument order rather than content
    ParameterOrder,
}

/// One retry actually performed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEvent {
    pub signature: RetrySignature,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Full context of a genuine failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetails {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
    /// Request exactly as last sent
    #[serde(default)]
    pub request: Value,
    /// Response (or transport error) exactly as received
    #[serde(default)]
    pub response: Value,
}

impl FailureDetails {
    #[must_use]
    pub fn new(operation: Operation, message: impl Into<String>) -> Self {
        Self {
            operation,
            path: None,
            message: message.into(),
            request: Value::Null,
            response: Value::Null,
        }
    }

    #[must_use]
    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_exchange(mut self, request: Value, response: Value) -> Self {
        self.request = request;
        self.response = response;
        self
    }
}

/// Per-type verdict, tagged by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypeOutcome {
    Pass,
    Fail { failure: FailureDetails },
    /// No entity carries the type; the environment needs a fixture
    ComponentNotFound,
}

/// Result of testing one assigned type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub type_name: TypeName,
    /// Identifier the worker actually used; must equal `type_name`
    pub tested_type_name: TypeName,
    #[serde(flatten)]
    pub outcome: TypeOutcome,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    pub spawn_status: SpawnStatus,
    pub retry_count: u32,
    #[serde(default)]
    pub retries: Vec<RetryEvent>,
    #[serde(default)]
    pub mutations_passed: Vec<String>,
    pub total_mutations_attempted: usize,
}

impl WorkerResult {
    /// Passing result with nothing attempted yet
    #[must_use]
    pub fn new(type_name: TypeName) -> Self {
        Self {
            tested_type_name: type_name.clone(),
            type_name,
            outcome: TypeOutcome::Pass,
            entity_id: None,
            spawn_status: SpawnStatus::Untested,
            retry_count: 0,
            retries: Vec::new(),
            mutations_passed: Vec::new(),
            total_mutations_attempted: 0,
        }
    }

    /// Record a performed retry
    pub fn record_retry(&mut self, event: RetryEvent) {
        self.retries.push(event);
        self.retry_count += 1;
    }

    /// Mark as genuinely failed
    pub fn fail(&mut self, failure: FailureDetails) {
        self.outcome = TypeOutcome::Fail { failure };
    }

    #[inline]
    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self.outcome, TypeOutcome::Pass)
    }

    #[inline]
    #[must_use]
    pub fn is_fail(&self) -> bool {
        matches!(self.outcome, TypeOutcome::Fail { .. })
    }

    #[inline]
    #[must_use]
    pub fn is_component_not_found(&self) -> bool {
        matches!(self.outcome, TypeOutcome::ComponentNotFound)
    }

    /// Failure details when failed
    #[must_use]
    pub fn failure(&self) -> Option<&FailureDetails> {
        match &self.outcome {
            TypeOutcome::Fail { failure } => Some(failure),
            _ => None,
        }
    }

    /// Check identifier integrity and retry accounting
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.tested_type_name != self.type_name {
            return Err(ModelError::IdentifierMismatch {
                assigned: self.type_name.clone(),
                tested: self.tested_type_name.clone(),
            });
        }
        if self.retry_count as usize != self.retries.len() {
            return Err(ModelError::RetryAccounting {
                type_name: self.type_name.clone(),
                reported: self.retry_count,
                recorded: self.retries.len(),
            });
        }
        Ok(())
    }
}
