//! Batch run loop
//!
//! Drives a whole run against a fleet of runtime instances:
//! - Makes sure every worker's instance is up
//! - Fetches a fresh capability snapshot and syncs the progress store
//! - Walks pending batches in ascending order until none remain
//! - Remediates types that had no entity, then re-issues the same batch
//! - Halts on the first batch that ends with failures

use crate::client::ClientFactory;
use crate::config::OrchestratorConfig;
use crate::error::CapcheckError;
use crate::merger::{HaltCause, MergeDecision, ResultMerger};
use crate::pool::{DispatchStats, WorkerPool};
use crate::runtime::{restart, wait_until_running, InstanceSpec, InstanceStatus, RuntimeControl};
use crate::worker::{StateBoard, WorkerReport, WorkerSettings};
use capcheck_model::{Assignment, CapabilitySnapshot, TypeName};
use capcheck_store::{BatchScheduler, ProgressDocument, ProgressStats, ProgressStore, SyncReport};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How a run ended
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// No pending batch left
    #[default]
    Completed,
    /// Stopped at the requested number of batches
    BatchLimit,
    /// A batch ended with failures or untrusted results
    Halted { batch: u32, causes: Vec<HaltCause> },
    /// Fixtures and restarts did not make these types testable
    RemediationExhausted { batch: u32, missing: Vec<TypeName> },
}

impl RunStatus {
    /// Check if the run stopped without halting
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::BatchLimit)
    }
}

/// Store preparation at the start of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preparation {
    /// The store did not exist and was created from the snapshot
    pub created: bool,
    pub sync: SyncReport,
    /// Failed records returned to untested
    pub reset: usize,
    /// Records that received a batch number
    pub assigned: usize,
}

/// What a run did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    /// Distinct batch numbers dispatched
    pub batches_run: usize,
    pub passed: BTreeSet<TypeName>,
    pub failed: BTreeSet<TypeName>,
    pub remediations: u32,
    /// Remote calls made by all workers
    pub calls: usize,
    pub stats: ProgressStats,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Batches run: {} ({} passed, {} failed, {} remediations, {} calls)",
            self.batches_run,
            self.passed.len(),
            self.failed.len(),
            self.remediations,
            self.calls
        )?;
        match &self.status {
            RunStatus::Completed => writeln!(f, "All batches complete")?,
            RunStatus::BatchLimit => writeln!(f, "Stopped at batch limit")?,
            RunStatus::Halted { batch, causes } => {
                writeln!(f, "HALTED in batch {batch}:")?;
                for cause in causes {
                    match cause {
                        HaltCause::Failed { type_name, failure } => {
                            let at = failure
                                .path
                                .as_deref()
                                .map(|p| format!(" at `{p}`"))
                                .unwrap_or_default();
                            writeln!(
                                f,
                                "  {type_name}: {} failed{at}: {}",
                                failure.operation, failure.message
                            )?;
                            writeln!(f, "    request:  {}", failure.request)?;
                            writeln!(f, "    response: {}", failure.response)?;
                        }
                        HaltCause::Integrity { type_name, reason } => {
                            writeln!(f, "  {type_name}: untrusted result: {reason}")?;
                        }
                        HaltCause::Unreported {
                            worker,
                            types,
                            reason,
                        } => {
                            writeln!(f, "  worker {worker} did not report {types:?}: {reason}")?;
                        }
                    }
                }
            }
            RunStatus::RemediationExhausted { batch, missing } => {
                writeln!(f, "HALTED in batch {batch}: no entity for {missing:?} after remediation")?;
            }
        }
        write!(f, "{}", self.stats)
    }
}

/// Owns one run: scheduling, dispatch, merging and remediation
///
/// The merger is the only writer of type statuses; the orchestrator itself
/// writes the store only while preparing a run.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn ProgressStore>,
    clients: Arc<dyn ClientFactory>,
    control: Arc<dyn RuntimeControl>,
    scheduler: BatchScheduler,
    pool: WorkerPool,
    merger: ResultMerger,
}

impl Orchestrator {
    /// Create an orchestrator over a validated configuration
    ///
    /// # Errors
    /// - `CapcheckError::Config` if the fleet cannot cover a batch
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn ProgressStore>,
        clients: Arc<dyn ClientFactory>,
        control: Arc<dyn RuntimeControl>,
    ) -> Result<Self, CapcheckError> {
        config.validate()?;
        let scheduler =
            BatchScheduler::new(config.worker_count, config.types_per_worker, config.base_port)?;
        let pool = WorkerPool::new(Arc::clone(&clients), WorkerSettings::from(&config));
        let merger = ResultMerger::new(Arc::clone(&store));
        Ok(Self {
            config,
            store,
            clients,
            control,
            scheduler,
            pool,
            merger,
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Live worker states of the current or last batch
    #[inline]
    #[must_use]
    pub fn board(&self) -> &StateBoard {
        self.pool.board()
    }

    fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.config.runtime.probe_interval_ms)
    }

    /// Launch any worker instance that is not responding
    pub async fn ensure_fleet(&self) -> Result<(), CapcheckError> {
        for worker in 0..self.scheduler.worker_count() {
            let port = self.scheduler.port_for(worker);
            if self.control.status(port).await == InstanceStatus::Running {
                continue;
            }
            tracing::info!("Starting runtime for worker {} on port {}", worker, port);
            self.control
                .launch(InstanceSpec { base_port: port }, 1)
                .await?;
            wait_until_running(
                self.control.as_ref(),
                port,
                self.config.runtime.startup_probes,
                self.probe_interval(),
            )
            .await?;
        }
        Ok(())
    }

    /// Fetch the full capability snapshot from the first instance
    pub async fn fetch_snapshot(&self) -> Result<CapabilitySnapshot, CapcheckError> {
        let client = self.clients.connect(self.config.base_port);
        let types = client.list_types().await?;
        tracing::info!("Registry lists {} types", types.len());
        let snapshot = client
            .get_schema(&types)
            .await?
            .stamped(client.endpoint(), chrono::Utc::now());
        Ok(snapshot)
    }

    /// Bring the store in line with `snapshot` and number the batches
    ///
    /// # Workflow
    /// 1. Create the store from the snapshot, or sync an existing one
    /// 2. Return failed records to untested when `retry_failed` is set
    /// 3. Number still-untested, non-excluded records in document order
    pub fn prepare(&self, snapshot: &CapabilitySnapshot) -> Result<Preparation, CapcheckError> {
        let mut preparation = Preparation::default();
        let mut document = if self.store.exists() {
            let mut document = self.store.load()?;
            preparation.sync = document.sync_with_snapshot(snapshot);
            document
        } else {
            preparation.created = true;
            ProgressDocument::from_snapshot(snapshot)
        };

        let sync = &preparation.sync;
        if !sync.added.is_empty() {
            tracing::info!("{} new types since last run", sync.added.len());
        }
        if !sync.paths_changed.is_empty() {
            tracing::info!(types = ?sync.paths_changed, "Path catalogues changed");
        }
        if !sync.missing_from_registry.is_empty() {
            tracing::warn!(types = ?sync.missing_from_registry, "Recorded types missing from registry");
        }

        if self.config.retry_failed {
            preparation.reset = document.reset(true);
            if preparation.reset > 0 {
                tracing::info!("Retrying {} previously failed types", preparation.reset);
            }
        }
        self.store.save(&document)?;

        let assigned = self
            .store
            .assign_batch_numbers(self.config.batch_size, &self.config.excluded())?;
        preparation.assigned = assigned.len();
        tracing::info!(
            store = %self.store.location(),
            "Prepared {} types for testing",
            preparation.assigned
        );
        Ok(preparation)
    }

    /// Run pending batches until none remain, a batch halts, or `max_batches` have advanced
    ///
    /// # Workflow
    /// 1. Start missing runtime instances
    /// 2. Fetch the snapshot and prepare the store
    /// 3. For each lowest pending batch: dispatch, merge, then advance,
    ///    remediate and re-issue, or halt
    ///
    /// # Errors
    /// Infrastructure failures only; failing types end the run with
    /// [`RunStatus::Halted`].
    pub async fn run(&mut self, max_batches: Option<usize>) -> Result<RunSummary, CapcheckError> {
        self.ensure_fleet().await?;
        let snapshot = Arc::new(self.fetch_snapshot().await?);
        self.prepare(&snapshot)?;

        let mut summary = RunSummary::default();
        // Batch whose dispatches are already counted in `batches_run`
        let mut current: Option<u32> = None;
        loop {
            let document = self.store.load()?;
            let Some((batch_number, records)) = self.scheduler.next_batch(&document) else {
                summary.status = RunStatus::Completed;
                break;
            };
            if current != Some(batch_number) {
                if max_batches.is_some_and(|max| summary.batches_run >= max) {
                    summary.status = RunStatus::BatchLimit;
                    break;
                }
                current = Some(batch_number);
                summary.batches_run += 1;
            }
            let names: Vec<TypeName> = records.into_iter().map(|r| r.type_name).collect();
            let assignments = self.scheduler.partition(batch_number, &names)?;
            tracing::info!(
                "Running batch {}: {} types on {} workers",
                batch_number,
                names.len(),
                assignments.len()
            );

            if let Some(status) = self
                .run_batch(batch_number, &assignments, &snapshot, &mut summary)
                .await?
            {
                summary.status = status;
                break;
            }
        }

        summary.stats = ProgressStats::compute(&self.store.load()?, &self.config.excluded());
        tracing::info!(status = ?summary.status, "Run finished");
        Ok(summary)
    }

    /// Dispatch one batch until it advances; `Some` ends the run
    async fn run_batch(
        &mut self,
        batch_number: u32,
        assignments: &[Assignment],
        snapshot: &Arc<CapabilitySnapshot>,
        summary: &mut RunSummary,
    ) -> Result<Option<RunStatus>, CapcheckError> {
        let mut attempts = 0;
        loop {
            let reports = self
                .pool
                .dispatch(assignments.to_vec(), Arc::clone(snapshot))
                .await;
            summary.calls += DispatchStats::from_reports(&reports).calls;

            let outcome = self.merger.merge(batch_number, &reports)?;
            summary.passed.extend(outcome.passed.iter().cloned());
            summary.failed.extend(outcome.failed.iter().cloned());
            if !outcome.deferred.is_empty() {
                tracing::info!(types = ?outcome.deferred, "Deferred to the next dispatch");
            }

            match outcome.decision {
                MergeDecision::Advance => return Ok(None),
                MergeDecision::Halt { causes } => {
                    tracing::error!("Batch {} halted with {} causes", batch_number, causes.len());
                    return Ok(Some(RunStatus::Halted {
                        batch: batch_number,
                        causes,
                    }));
                }
                MergeDecision::Remediate { missing } => {
                    if attempts >= self.config.max_remediation_attempts {
                        tracing::error!(
                            ?missing,
                            "Remediation exhausted for batch {} after {} attempts",
                            batch_number,
                            attempts
                        );
                        return Ok(Some(RunStatus::RemediationExhausted {
                            batch: batch_number,
                            missing,
                        }));
                    }
                    attempts += 1;
                    summary.remediations += 1;
                    let ports = affected_ports(&reports, &missing);
                    self.remediate(&missing, &ports).await?;
                    tracing::info!("Re-issuing batch {} (attempt {})", batch_number, attempts);
                }
            }
        }
    }

    /// Request fixtures for `missing` and restart the instances that lacked them
    async fn remediate(&self, missing: &[TypeName], ports: &[u16]) -> Result<(), CapcheckError> {
        tracing::warn!(?missing, ?ports, "Adding fixtures and restarting");
        self.control.add_fixtures(missing).await?;
        restart(
            self.control.as_ref(),
            ports,
            self.config.runtime.startup_probes,
            self.probe_interval(),
        )
        .await?;
        Ok(())
    }
}

/// Ports of the workers that reported any of `missing`
fn affected_ports(reports: &[WorkerReport], missing: &[TypeName]) -> Vec<u16> {
    let ports: BTreeSet<u16> = reports
        .iter()
        .filter(|report| {
            report
                .results
                .iter()
                .any(|r| r.is_component_not_found() && missing.contains(&r.type_name))
        })
        .map(|report| report.assignment.port)
        .collect();
    ports.into_iter().collect()
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("store", &self.store.location())
            .field("scheduler", &self.scheduler)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
