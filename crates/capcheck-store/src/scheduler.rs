//! Batch scheduler
//!
//! Picks the next batch from the progress document and slices it into
//! per-worker assignments. Each worker owns one runtime instance on
//! `base_port + worker_index`.

use crate::document::ProgressDocument;
use crate::error::StoreError;
use capcheck_model::{Assignment, TypeName, TypeRecord};

/// Splits batches across a fixed worker fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchScheduler {
    worker_count: usize,
    types_per_worker: usize,
    base_port: u16,
}

impl BatchScheduler {
    /// Create a scheduler
    ///
    /// # Errors
    /// - `StoreError::InvalidParameter` if either count is zero or the
    ///   fleet's ports would overflow
    pub fn new(
        worker_count: usize,
        types_per_worker: usize,
        base_port: u16,
    ) -> Result<Self, StoreError> {
        if worker_count == 0 || types_per_worker == 0 {
            return Err(StoreError::InvalidParameter(
                "worker count and types per worker must be non-zero".to_string(),
            ));
        }
        let last = u16::try_from(worker_count - 1)
            .ok()
            .and_then(|offset| base_port.checked_add(offset));
        if last.is_none() {
            return Err(StoreError::InvalidParameter(format!(
                "{worker_count} workers from port {base_port} overflow the port range"
            )));
        }
        Ok(Self {
            worker_count,
            types_per_worker,
            base_port,
        })
    }

    #[inline]
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Largest batch this fleet can take in one pass
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.worker_count * self.types_per_worker
    }

    /// Port of a worker's runtime instance
    #[inline]
    #[must_use]
    pub fn port_for(&self, worker_index: usize) -> u16 {
        self.base_port
            .saturating_add(u16::try_from(worker_index).unwrap_or(u16::MAX))
    }

    /// Lowest-numbered pending batch and its records
    #[must_use]
    pub fn next_batch(&self, document: &ProgressDocument) -> Option<(u32, Vec<TypeRecord>)> {
        let batch_number = document.pending_batches().into_iter().next()?;
        let records = document.batch(batch_number).into_iter().cloned().collect();
        Some((batch_number, records))
    }

    /// Slice a batch into assignments
    pub fn partition(
        &self,
        batch_number: u32,
        types: &[TypeName],
    ) -> Result<Vec<Assignment>, StoreError> {
        partition(
            batch_number,
            types,
            self.worker_count,
            self.types_per_worker,
            self.base_port,
        )
    }
}

/// Order-preserving slicing into runs of `types_per_worker`
///
/// The last assignment takes the remainder. Fewer assignments than
/// workers are produced when the batch is small.
///
/// # Errors
/// - `StoreError::InsufficientCapacity` when `worker_count * types_per_worker < types.len()`
pub fn partition(
    batch_number: u32,
    types: &[TypeName],
    worker_count: usize,
    types_per_worker: usize,
    base_port: u16,
) -> Result<Vec<Assignment>, StoreError> {
    if types_per_worker == 0 {
        return Err(StoreError::InvalidParameter(
            "types per worker must be non-zero".to_string(),
        ));
    }
    if worker_count.saturating_mul(types_per_worker) < types.len() {
        return Err(StoreError::InsufficientCapacity {
            workers: worker_count,
            per_worker: types_per_worker,
            types: types.len(),
        });
    }

    types
        .chunks(types_per_worker)
        .enumerate()
        .map(|(worker_index, chunk)| {
            let port = u16::try_from(worker_index)
                .ok()
                .and_then(|offset| base_port.checked_add(offset))
                .ok_or_else(|| {
                    StoreError::InvalidParameter(format!(
                        "worker {worker_index} port overflows from {base_port}"
                    ))
                })?;
            Ok(Assignment {
                batch_number,
                worker_index,
                port,
                type_names: chunk.to_vec(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(n: usize) -> Vec<TypeName> {
        (0..n).map(|i| TypeName::new(format!("T{i}"))).collect()
    }

    #[test]
    fn partition_twenty_over_ten_workers() {
        let assignments = partition(4, &names(20), 10, 2, 20_000).unwrap();
        assert_eq!(assignments.len(), 10);
        assert!(assignments.iter().all(|a| a.type_names.len() == 2));
        assert_eq!(assignments[9].port, 20_009);
        assert_eq!(assignments[0].batch_number, 4);
    }

    #[test]
    fn partition_remainder_goes_to_last_worker() {
        let assignments = partition(1, &names(5), 3, 2, 100).unwrap();
        let sizes: Vec<usize> = assignments.iter().map(|a| a.type_names.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn partition_rejects_overflowing_batch() {
        let err = partition(1, &names(7), 3, 2, 100).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientCapacity { types: 7, .. }));
    }

    #[test]
    fn scheduler_rejects_zero_workers() {
        assert!(BatchScheduler::new(0, 1, 100).is_err());
        assert!(BatchScheduler::new(2, 0, 100).is_err());
        assert!(BatchScheduler::new(10, 1, u16::MAX - 3).is_err());
    }

    proptest! {
        #[test]
        fn partition_covers_each_type_exactly_once(
            n in 0usize..60,
            workers in 1usize..12,
            per_worker in 1usize..8,
        ) {
            let types = names(n);
            match partition(1, &types, workers, per_worker, 30_000) {
                Ok(assignments) => {
                    let flattened: Vec<TypeName> = assignments
                        .iter()
                        .flat_map(|a| a.type_names.iter().cloned())
                        .collect();
                    prop_assert_eq!(flattened, types);
                    prop_assert!(assignments.len() <= workers);
                    prop_assert!(assignments.iter().all(|a| a.type_names.len() <= per_worker));
                }
                Err(_) => prop_assert!(workers * per_worker < n),
            }
        }
    }
}
