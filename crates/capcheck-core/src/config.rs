//! Orchestrator configuration
//!
//! Loaded from TOML; every field has a default so a partial file (or none)
//! is valid. CLI flags override through the `with_*` builders.
//!
//! ```toml
//! store_path = "mutation_test_progress.json"
//! worker_count = 10
//! types_per_worker = 3
//! batch_size = 30
//! verify = "read_back"
//!
//! [runtime]
//! program = "cargo"
//! args = ["run", "--example", "extras_plugin"]
//! ```

use crate::error::CapcheckError;
use capcheck_model::TypeName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Default port of the runtime's remote protocol
pub const DEFAULT_BASE_PORT: u16 = 15702;

/// Sentinel entity id that catalogue examples use for entity references
pub const DEFAULT_ENTITY_PLACEHOLDER: u64 = 8_589_934_670;

/// How a mutation is confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// The call's own success signal
    #[default]
    TrustCall,
    /// Re-read the component and compare the value at the path
    ReadBack,
}

/// How to start runtime instances for remediation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeCommand {
    pub program: Option<String>,
    pub args: Vec<String>,
    /// Environment variable carrying the instance's port
    pub port_env: String,
    /// Status probes before an instance counts as unresponsive
    pub startup_probes: u32,
    pub probe_interval_ms: u64,
}

impl Default for RuntimeCommand {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            port_env: "BRP_PORT".to_string(),
            startup_probes: 20,
            probe_interval_ms: 500,
        }
    }
}

/// Run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub store_path: PathBuf,
    pub baseline_path: PathBuf,
    pub archive_dir: PathBuf,
    pub snapshot_path: PathBuf,
    pub host: String,
    /// Worker `i` talks to `base_port + i`
    pub base_port: u16,
    pub worker_count: usize,
    pub types_per_worker: usize,
    pub batch_size: usize,
    pub verify: VerifyMode,
    /// Absolute tolerance for float comparison in read-back verification
    pub float_tolerance: f64,
    /// Remediation rounds per batch before the run halts
    pub max_remediation_attempts: u32,
    /// Remote calls a worker may make before bailing out with partial results
    pub max_calls_per_worker: Option<usize>,
    pub entity_placeholder: u64,
    /// Types never scheduled
    pub excluded_types: Vec<TypeName>,
    /// Return failed records to `untested` at the start of a run
    pub retry_failed: bool,
    pub runtime: RuntimeCommand,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("mutation_test_progress.json"),
            baseline_path: PathBuf::from("mutation_test_baseline.json"),
            archive_dir: PathBuf::from("archive"),
            snapshot_path: PathBuf::from("capability_snapshot.json"),
            host: "localhost".to_string(),
            base_port: DEFAULT_BASE_PORT,
            worker_count: 10,
            types_per_worker: 3,
            batch_size: 30,
            verify: VerifyMode::TrustCall,
            float_tolerance: 1e-4,
            max_remediation_attempts: 2,
            max_calls_per_worker: None,
            entity_placeholder: DEFAULT_ENTITY_PLACEHOLDER,
            excluded_types: Vec::new(),
            retry_failed: true,
            runtime: RuntimeCommand::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self, CapcheckError> {
        let config: Self =
            toml::from_str(input).map_err(|e| CapcheckError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self, CapcheckError> {
        let input = std::fs::read_to_string(path)
            .map_err(|e| CapcheckError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&input)
    }

    /// Check that the fleet can take a whole batch
    pub fn validate(&self) -> Result<(), CapcheckError> {
        if self.worker_count == 0 || self.types_per_worker == 0 || self.batch_size == 0 {
            return Err(CapcheckError::Config(
                "worker_count, types_per_worker and batch_size must be non-zero".to_string(),
            ));
        }
        if self.worker_count * self.types_per_worker < self.batch_size {
            return Err(CapcheckError::Config(format!(
                "{} workers x {} types cannot cover a batch of {}",
                self.worker_count, self.types_per_worker, self.batch_size
            )));
        }
        if self.float_tolerance.is_nan() || self.float_tolerance < 0.0 {
            return Err(CapcheckError::Config(
                "float_tolerance must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }

    /// With worker count
    #[inline]
    #[must_use]
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_types_per_worker(mut self, types_per_worker: usize) -> Self {
        self.types_per_worker = types_per_worker;
        self
    }

    /// With batch size
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_verify(mut self, verify: VerifyMode) -> Self {
        self.verify = verify;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_call_budget(mut self, max_calls: usize) -> Self {
        self.max_calls_per_worker = Some(max_calls);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_excluded(mut self, types: impl IntoIterator<Item = TypeName>) -> Self {
        self.excluded_types.extend(types);
        self
    }

    /// Size the fleet so it covers `batch_size` with the current types per worker
    #[must_use]
    pub fn fit_workers_to_batch(mut self) -> Self {
        self.worker_count = self.batch_size.div_ceil(self.types_per_worker.max(1));
        self
    }

    /// Excluded types as a set
    #[must_use]
    pub fn excluded(&self) -> BTreeSet<TypeName> {
        self.excluded_types.iter().cloned().collect()
    }
}
