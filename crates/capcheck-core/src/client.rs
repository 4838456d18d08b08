//! Remote introspection client interface
//!
//! Workers only see [`IntrospectionClient`]; the HTTP implementation lives
//! in [`crate::http_client`] and tests substitute an in-memory runtime.

use crate::error::ClientError;
use async_trait::async_trait;
use capcheck_model::{CapabilitySnapshot, EntityId, MutationKind, TypeName};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// What a mutation is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationTarget {
    Entity(EntityId),
    /// Resources are global and need no entity
    Resource,
}

/// Order in which `path` and `value` are sent in a mutate call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentOrder {
    #[default]
    PathThenValue,
    ValueThenPath,
}

impl ArgumentOrder {
    #[must_use]
    pub fn swapped(self) -> Self {
        match self {
            Self::PathThenValue => Self::ValueThenPath,
            Self::ValueThenPath => Self::PathThenValue,
        }
    }
}

/// One mutate call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutateRequest {
    pub target: MutationTarget,
    pub type_name: TypeName,
    /// Mutation path; empty for the root value
    pub path: String,
    pub value: Value,
    pub order: ArgumentOrder,
}

impl MutateRequest {
    #[must_use]
    pub fn new(
        target: MutationTarget,
        type_name: TypeName,
        path: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            target,
            type_name,
            path: path.into(),
            value,
            order: ArgumentOrder::default(),
        }
    }

    /// Request as captured in failure details
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "target": self.target,
            "type_name": self.type_name,
            "path": self.path,
            "value": self.value,
            "order": self.order,
        })
    }
}

/// Entity query filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryFilter {
    /// Entities must carry all of these
    pub with: Vec<TypeName>,
    /// Entities must carry none of these
    pub without: Vec<TypeName>,
}

impl QueryFilter {
    /// Entities carrying `type_name`
    #[must_use]
    pub fn with_type(type_name: TypeName) -> Self {
        Self {
            with: vec![type_name],
            without: Vec::new(),
        }
    }

    /// Any entity
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }
}

/// Remote calls against one runtime instance
#[async_trait]
pub trait IntrospectionClient: Send + Sync {
    /// Address of the instance, for diagnostics
    fn endpoint(&self) -> &str;

    /// All registered type names
    async fn list_types(&self) -> Result<Vec<TypeName>, ClientError>;

    /// Capability entries for the given types
    async fn get_schema(&self, types: &[TypeName]) -> Result<CapabilitySnapshot, ClientError>;

    /// Spawn a component entity or insert a resource
    ///
    /// Returns the spawned entity for components.
    async fn spawn_or_insert(
        &self,
        kind: MutationKind,
        type_name: &TypeName,
        value: &Value,
    ) -> Result<Option<EntityId>, ClientError>;

    /// Entities matching a filter
    async fn query(&self, filter: &QueryFilter) -> Result<Vec<EntityId>, ClientError>;

    async fn mutate_field(&self, request: &MutateRequest) -> Result<(), ClientError>;

    /// Current value of a component or resource
    async fn get_field(
        &self,
        target: MutationTarget,
        type_name: &TypeName,
    ) -> Result<Value, ClientError>;
}

/// Produces a client bound to one runtime instance
pub trait ClientFactory: Send + Sync {
    fn connect(&self, port: u16) -> Arc<dyn IntrospectionClient>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_json_carries_order() {
        let mut request = MutateRequest::new(
            MutationTarget::Entity(EntityId(7)),
            TypeName::new("Foo"),
            ".count",
            json!(5),
        );
        request.order = request.order.swapped();
        let value = request.to_json();
        assert_eq!(value["order"], json!("value_then_path"));
        assert_eq!(value["target"], json!({"entity": 7}));
    }
}
