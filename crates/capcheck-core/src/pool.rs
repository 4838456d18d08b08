//! Worker pool
//!
//! Dispatches one batch's assignments to parallel workers, one task per
//! runtime instance, and blocks until every worker has returned:
//! - Workers share no mutable state; each gets its own client
//! - A worker task that dies yields the results it finished before dying
//! - Reports come back in assignment order

use crate::client::ClientFactory;
use crate::worker::{AbortReason, StateBoard, Worker, WorkerReport, WorkerSettings, WorkerState};
use capcheck_model::{Assignment, CapabilitySnapshot};
use futures::future::join_all;
use std::sync::Arc;

/// Pool statistics for one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub workers: usize,
    pub results: usize,
    pub aborted: usize,
    pub calls: usize,
}

impl DispatchStats {
    #[must_use]
    pub fn from_reports(reports: &[WorkerReport]) -> Self {
        Self {
            workers: reports.len(),
            results: reports.iter().map(|r| r.results.len()).sum(),
            aborted: reports.iter().filter(|r| r.aborted.is_some()).count(),
            calls: reports.iter().map(|r| r.state.calls_made).sum(),
        }
    }
}

/// Runs assignments on parallel workers
pub struct WorkerPool {
    factory: Arc<dyn ClientFactory>,
    settings: WorkerSettings,
    board: StateBoard,
}

impl WorkerPool {
    #[must_use]
    pub fn new(factory: Arc<dyn ClientFactory>, settings: WorkerSettings) -> Self {
        Self {
            factory,
            settings,
            board: StateBoard::default(),
        }
    }

    /// Live worker states of the current or last dispatch
    #[inline]
    #[must_use]
    pub fn board(&self) -> &StateBoard {
        &self.board
    }

    /// Run every assignment and wait for all of them
    pub async fn dispatch(
        &mut self,
        assignments: Vec<Assignment>,
        snapshot: Arc<CapabilitySnapshot>,
    ) -> Vec<WorkerReport> {
        self.board = StateBoard::new(assignments.len());
        tracing::info!("Dispatching {} workers", assignments.len());

        let handles: Vec<_> = assignments
            .into_iter()
            .map(|assignment| {
                let client = self.factory.connect(assignment.port);
                let worker = Worker::new(
                    assignment.worker_index,
                    assignment.port,
                    client,
                    Arc::clone(&snapshot),
                    self.settings,
                )
                .with_board(self.board.clone());
                let handle = tokio::spawn(worker.run(assignment.clone()));
                (assignment, handle)
            })
            .collect();

        let board = self.board.clone();
        let reports = join_all(handles.into_iter().map(|(assignment, handle)| {
            let board = board.clone();
            async move {
                match handle.await {
                    Ok(report) => report,
                    Err(join_error) => {
                        let state = board.get(assignment.worker_index).unwrap_or_else(|| {
                            WorkerState::new(assignment.worker_index, assignment.port)
                        });
                        tracing::error!(
                            worker = assignment.worker_index,
                            ?state,
                            "Worker task died: {}",
                            join_error
                        );
                        let results = board.finished(assignment.worker_index);
                        WorkerReport {
                            assignment,
                            results,
                            state,
                            aborted: Some(AbortReason::Crashed {
                                message: join_error.to_string(),
                            }),
                        }
                    }
                }
            }
        }))
        .await;

        let stats = DispatchStats::from_reports(&reports);
        tracing::info!(
            results = stats.results,
            aborted = stats.aborted,
            calls = stats.calls,
            "All workers returned"
        );
        reports
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("settings", &self.settings)
            .field("board", &self.board)
            .finish_non_exhaustive()
    }
}
