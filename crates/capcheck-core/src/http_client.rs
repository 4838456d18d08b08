//! JSON-RPC over HTTP client for the runtime's remote protocol
//!
//! Connection failures map to [`ClientError::Transport`]; error objects in
//! the response map to [`ClientError::Rpc`] with the request and response
//! captured verbatim. No timeout is imposed on individual calls.

use crate::client::{
    ArgumentOrder, ClientFactory, IntrospectionClient, MutateRequest, MutationTarget, QueryFilter,
};
use crate::error::ClientError;
use async_trait::async_trait;
use capcheck_model::{CapabilityEntry, CapabilitySnapshot, EntityId, MutationKind, TypeName};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Method names of the remote protocol
pub mod methods {
    pub const LIST: &str = "bevy/list";
    pub const TYPE_GUIDE: &str = "brp_type_guide";
    pub const SPAWN: &str = "bevy/spawn";
    pub const INSERT_RESOURCE: &str = "bevy/insert_resource";
    pub const QUERY: &str = "bevy/query";
    pub const MUTATE_COMPONENT: &str = "bevy/mutate_component";
    pub const MUTATE_RESOURCE: &str = "bevy/mutate_resource";
    pub const GET: &str = "bevy/get";
    pub const GET_RESOURCE: &str = "bevy/get_resource";
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

// Field order is what the server sees; the two variants differ only there.
#[derive(Serialize)]
struct MutatePathFirst<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    entity: Option<EntityId>,
    #[serde(rename = "component")]
    type_name: &'a TypeName,
    path: &'a str,
    value: &'a Value,
}

#[derive(Serialize)]
struct MutateValueFirst<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    entity: Option<EntityId>,
    #[serde(rename = "component")]
    type_name: &'a TypeName,
    value: &'a Value,
    path: &'a str,
}

/// Client for one runtime instance
#[derive(Debug)]
pub struct HttpIntrospectionClient {
    http: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl HttpIntrospectionClient {
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self::with_client(reqwest::Client::new(), host, port)
    }

    /// Share an existing connection pool
    #[must_use]
    pub fn with_client(http: reqwest::Client, host: &str, port: u16) -> Self {
        Self {
            http,
            endpoint: format!("http://{host}:{port}"),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<P: Serialize + Send + Sync>(
        &self,
        method: &str,
        params: P,
    ) -> Result<Value, ClientError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let captured = serde_json::to_value(&request)
            .map_err(|e| ClientError::Protocol(format!("unserializable request: {e}")))?;
        tracing::debug!(endpoint = %self.endpoint, method, "Calling runtime");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ClientError::Transport {
                endpoint: self.endpoint.clone(),
                message: e.to_string(),
            })?;
        let body: Value = response.json().await.map_err(|e| {
            if e.is_decode() {
                ClientError::Protocol(e.to_string())
            } else {
                ClientError::Transport {
                    endpoint: self.endpoint.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        if let Some(error) = body.get("error") {
            return Err(ClientError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                request: captured,
                response: body,
            });
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| ClientError::Protocol(format!("{method}: response has no result")))
    }
}

fn parse_entity(value: &Value) -> Option<EntityId> {
    value.get("entity").and_then(Value::as_u64).map(EntityId)
}

fn parse_guide(result: Value) -> Result<CapabilitySnapshot, ClientError> {
    let guide = match result {
        Value::Object(mut object) => match object.remove("type_guide") {
            Some(Value::Object(guide)) => guide,
            Some(_) => return Err(ClientError::Protocol("type_guide is not an object".into())),
            None => object,
        },
        _ => return Err(ClientError::Protocol("type guide is not an object".into())),
    };
    let entries = guide
        .into_iter()
        .map(|(name, mut entry)| {
            if let Value::Object(fields) = &mut entry {
                fields
                    .entry("type_name")
                    .or_insert_with(|| Value::String(name.clone()));
            }
            serde_json::from_value::<CapabilityEntry>(entry)
                .map_err(|e| ClientError::Protocol(format!("entry for {name}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CapabilitySnapshot::from_entries(entries))
}

#[async_trait]
impl IntrospectionClient for HttpIntrospectionClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_types(&self) -> Result<Vec<TypeName>, ClientError> {
        let result = self.call(methods::LIST, Value::Null).await?;
        serde_json::from_value(result).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    async fn get_schema(&self, types: &[TypeName]) -> Result<CapabilitySnapshot, ClientError> {
        let result = self
            .call(methods::TYPE_GUIDE, json!({ "types": types }))
            .await?;
        parse_guide(result)
    }

    async fn spawn_or_insert(
        &self,
        kind: MutationKind,
        type_name: &TypeName,
        value: &Value,
    ) -> Result<Option<EntityId>, ClientError> {
        match kind {
            MutationKind::Component => {
                let result = self
                    .call(
                        methods::SPAWN,
                        json!({ "components": { type_name.as_str(): value } }),
                    )
                    .await?;
                Ok(parse_entity(&result))
            }
            MutationKind::Resource => {
                self.call(
                    methods::INSERT_RESOURCE,
                    json!({ "resource": type_name, "value": value }),
                )
                .await?;
                Ok(None)
            }
        }
    }

    async fn query(&self, filter: &QueryFilter) -> Result<Vec<EntityId>, ClientError> {
        let result = self
            .call(
                methods::QUERY,
                json!({
                    "data": { "components": [] },
                    "filter": { "with": filter.with, "without": filter.without },
                }),
            )
            .await?;
        let rows = result
            .as_array()
            .ok_or_else(|| ClientError::Protocol("query result is not an array".into()))?;
        Ok(rows.iter().filter_map(parse_entity).collect())
    }

    async fn mutate_field(&self, request: &MutateRequest) -> Result<(), ClientError> {
        let (method, entity) = match request.target {
            MutationTarget::Entity(entity) => (methods::MUTATE_COMPONENT, Some(entity)),
            MutationTarget::Resource => (methods::MUTATE_RESOURCE, None),
        };
        match request.order {
            ArgumentOrder::PathThenValue => {
                let params = MutatePathFirst {
                    entity,
                    type_name: &request.type_name,
                    path: &request.path,
                    value: &request.value,
                };
                self.call(method, params).await?;
            }
            ArgumentOrder::ValueThenPath => {
                let params = MutateValueFirst {
                    entity,
                    type_name: &request.type_name,
                    value: &request.value,
                    path: &request.path,
                };
                self.call(method, params).await?;
            }
        }
        Ok(())
    }

    async fn get_field(
        &self,
        target: MutationTarget,
        type_name: &TypeName,
    ) -> Result<Value, ClientError> {
        match target {
            MutationTarget::Entity(entity) => {
                let result = self
                    .call(
                        methods::GET,
                        json!({ "entity": entity, "components": [type_name] }),
                    )
                    .await?;
                result
                    .get("components")
                    .and_then(|c| c.get(type_name.as_str()))
                    .cloned()
                    .ok_or_else(|| ClientError::Protocol(format!("{type_name} missing from get")))
            }
            MutationTarget::Resource => {
                let result = self
                    .call(methods::GET_RESOURCE, json!({ "resource": type_name }))
                    .await?;
                result
                    .get("value")
                    .cloned()
                    .ok_or_else(|| ClientError::Protocol(format!("{type_name} missing from get")))
            }
        }
    }
}

/// Factory connecting to `host:port` with a shared connection pool
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    http: reqwest::Client,
    host: String,
}

impl HttpClientFactory {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: host.into(),
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(&self, port: u16) -> Arc<dyn IntrospectionClient> {
        Arc::new(HttpIntrospectionClient::with_client(
            self.http.clone(),
            &self.host,
            port,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutate_params_keep_field_order() {
        let name = TypeName::new("Foo");
        let value = json!(5);
        let path_first = serde_json::to_string(&MutatePathFirst {
            entity: Some(EntityId(1)),
            type_name: &name,
            path: ".count",
            value: &value,
        })
        .unwrap();
        let value_first = serde_json::to_string(&MutateValueFirst {
            entity: None,
            type_name: &name,
            value: &value,
            path: ".count",
        })
        .unwrap();
        assert_eq!(path_first, r#"{"entity":1,"component":"Foo","path":".count","value":5}"#);
        assert_eq!(value_first, r#"{"component":"Foo","value":5,"path":".count"}"#);
    }

    #[test]
    fn guide_entries_take_their_key_as_name() {
        let snapshot = parse_guide(json!({
            "type_guide": {
                "game::Foo": {
                    "mutation_kind": "Component",
                    "supported_operations": ["spawn", "mutate"],
                    "spawn_format": {"count": 1},
                    "mutation_paths": {
                        ".count": {"example": 2, "path_kind": "StructField"}
                    }
                }
            }
        }))
        .unwrap();
        let entry = snapshot.get(&TypeName::new("game::Foo")).unwrap();
        assert_eq!(entry.mutation_paths.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_instance_is_transport_error() {
        // Port 9 (discard) is reserved and not expected to serve HTTP locally.
        let client = HttpIntrospectionClient::new("127.0.0.1", 9);
        let err = client.list_types().await.unwrap_err();
        assert!(err.is_transport());
    }
}
