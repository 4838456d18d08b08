//! capcheck core - mutation test orchestration
//!
//! Tests every registered type of a reflection-enabled runtime: each type
//! is spawned or inserted, then every mutatable field path is written with
//! example values over the runtime's remote introspection protocol.
//!
//! # Core Concepts
//!
//! - [`Orchestrator`]: The batch run loop; prepares the store and walks pending batches
//! - [`WorkerPool`] / [`Worker`]: Parallel per-instance execution of one batch
//! - [`IntrospectionClient`]: Remote calls against one runtime instance
//! - [`recovery::diagnose`]: Closed table of retryable request errors
//! - [`ResultMerger`]: The single writer of type statuses
//! - [`RuntimeControl`]: Instance launch, restart and fixture requests
//!
//! # Example
//!
//! ```rust,ignore
//! use capcheck_core::{
//!     HttpClientFactory, Orchestrator, OrchestratorConfig, ProcessRuntimeControl,
//! };
//! use capcheck_store::JsonFileStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestratorConfig::new().with_batch_size(30);
//! let store = Arc::new(JsonFileStore::new(&config.store_path));
//! let clients = Arc::new(HttpClientFactory::new(&config.host));
//! let control = Arc::new(ProcessRuntimeControl::new(config.runtime.clone(), &config.host));
//!
//! let mut orchestrator = Orchestrator::new(config, store, clients, control)?;
//! let summary = orchestrator.run(None).await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod http_client;
pub mod merger;
pub mod orchestrator;
pub mod pool;
pub mod recovery;
pub mod runtime;
pub mod worker;

pub use client::{
    ArgumentOrder, ClientFactory, IntrospectionClient, MutateRequest, MutationTarget, QueryFilter,
};
pub use config::{OrchestratorConfig, RuntimeCommand, VerifyMode, DEFAULT_BASE_PORT};
pub use error::{CapcheckError, ClientError, RuntimeError};
pub use http_client::{HttpClientFactory, HttpIntrospectionClient};
pub use merger::{HaltCause, MergeDecision, MergeOutcome, ResultMerger};
pub use orchestrator::{Orchestrator, Preparation, RunStatus, RunSummary};
pub use pool::{DispatchStats, WorkerPool};
pub use runtime::{
    ExternalRuntimeControl, InstanceSpec, InstanceStatus, ProcessRuntimeControl, RuntimeControl,
    RuntimeInstance,
};
pub use worker::{AbortReason, Phase, StateBoard, Worker, WorkerReport, WorkerSettings, WorkerState};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
