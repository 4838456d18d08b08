//! Error types for the orchestrator
//!
//! Mirrors the run's error taxonomy:
//! - Remote call failures ([`ClientError`]), split into transport and RPC errors
//! - Runtime instance control failures ([`RuntimeError`])
//! - Orchestrator-level failures ([`CapcheckError`]) wrapping store and config errors

use capcheck_model::ModelError;
use capcheck_store::StoreError;
use serde_json::Value;

/// Failure of one remote introspection call
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Runtime instance unreachable (connection refused, no response)
    #[error("transport failure at {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// The runtime answered with a structured error
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        request: Value,
        response: Value,
    },

    /// The runtime answered with something that is not a valid response
    #[error("malformed response: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Check if the runtime instance is unreachable
    #[inline]
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Check if the error could be self-inflicted and repaired by a retry
    ///
    /// Only structured rejections qualify; transport and protocol errors
    /// are never retried.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc { .. })
    }

    /// Error message as reported by the runtime
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transport { message, .. } | Self::Rpc { message, .. } => message,
            Self::Protocol(message) => message,
        }
    }

    /// Request and response captured for diagnosis
    #[must_use]
    pub fn exchange(&self) -> (Value, Value) {
        match self {
            Self::Rpc {
                request, response, ..
            } => (request.clone(), response.clone()),
            _ => (Value::Null, Value::Null),
        }
    }
}

/// Failure of the runtime control interface
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to launch runtime on port {port}: {source}")]
    Launch {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to shut down runtime on port {port}: {reason}")]
    Shutdown { port: u16, reason: String },

    /// Instance did not become responsive
    #[error("runtime on port {port} unresponsive after {attempts} probes")]
    Unresponsive { port: u16, attempts: u32 },

    /// No launch command is configured
    #[error("no runtime command configured")]
    NotConfigured,

    #[error("fixture request failed: {0}")]
    Fixture(String),
}

/// Orchestrator-level error
#[derive(Debug, thiserror::Error)]
pub enum CapcheckError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("runtime control error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CapcheckError {
    /// Check if this is an infrastructure error (store, transport, runtime control)
    #[inline]
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Runtime(_) | Self::Client(ClientError::Transport { .. })
        )
    }
}
