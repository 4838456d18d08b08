//! Baseline promotion
//!
//! Promoting copies the current progress document over the baseline and
//! keeps a timestamped archive copy next to it.

use crate::error::StoreError;
use crate::store::{read_document, write_atomic};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Result of a promotion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub baseline: PathBuf,
    pub archive: PathBuf,
    pub types: usize,
}

/// Locations involved in baseline management
#[derive(Debug, Clone)]
pub struct BaselineManager {
    baseline: PathBuf,
    archive_dir: PathBuf,
}

impl BaselineManager {
    #[must_use]
    pub fn new(baseline: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            baseline: baseline.into(),
            archive_dir: archive_dir.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn baseline_path(&self) -> &Path {
        &self.baseline
    }

    /// Archive file name for a promotion at `at`
    #[must_use]
    pub fn archive_path(&self, at: DateTime<Utc>) -> PathBuf {
        let stem = self
            .baseline
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("baseline");
        self.archive_dir
            .join(format!("{stem}_{}.json", at.format("%Y%m%d_%H%M%S")))
    }

    /// Promote `current` to baseline
    ///
    /// The current document must load cleanly; a corrupt store is never
    /// promoted.
    pub fn promote(&self, current: &Path, at: DateTime<Utc>) -> Result<Promotion, StoreError> {
        let document = read_document(current)?;
        let bytes = serde_json::to_vec_pretty(&document)?;

        let archive = self.archive_path(at);
        write_atomic(&archive, &bytes)?;
        write_atomic(&self.baseline, &bytes)?;

        tracing::info!(
            baseline = %self.baseline.display(),
            archive = %archive.display(),
            types = document.len(),
            "promoted progress store to baseline"
        );

        Ok(Promotion {
            baseline: self.baseline.clone(),
            archive,
            types: document.len(),
        })
    }

    /// Archived baselines, oldest first
    pub fn archives(&self) -> Result<Vec<PathBuf>, StoreError> {
        if !self.archive_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.archive_dir)
            .map_err(|e| StoreError::io(&self.archive_dir, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.archive_dir, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}
