//! Progress store backends
//!
//! A store hands out whole documents and accepts whole documents back.
//! Saves are all-or-nothing: the file backend writes a temporary file in
//! the target directory and renames it over the old document, so a crash
//! leaves either the previous or the new document, never a mix.

use crate::document::ProgressDocument;
use crate::error::StoreError;
use capcheck_model::TypeName;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Transactional load/save of the progress document
pub trait ProgressStore: Send + Sync {
    /// Load and validate the whole document
    fn load(&self) -> Result<ProgressDocument, StoreError>;

    /// Replace the whole document atomically
    fn save(&self, document: &ProgressDocument) -> Result<(), StoreError>;

    /// Check if a document has been saved before
    fn exists(&self) -> bool;

    /// Human-readable location for logs
    fn location(&self) -> String;

    /// Drop every batch number and persist
    fn clear_batch_numbers(&self) -> Result<(), StoreError> {
        let mut document = self.load()?;
        document.clear_batch_numbers();
        self.save(&document)
    }

    /// Reassign batch numbers to still-untested records and persist
    fn assign_batch_numbers(
        &self,
        batch_size: usize,
        excluded: &BTreeSet<TypeName>,
    ) -> Result<IndexMap<TypeName, u32>, StoreError> {
        let mut document = self.load()?;
        let assigned = document.assign_batch_numbers_excluding(batch_size, excluded)?;
        self.save(&document)?;
        Ok(assigned)
    }
}

/// JSON document on the local filesystem
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read and validate a progress document from any path
pub fn read_document(path: &Path) -> Result<ProgressDocument, StoreError> {
    let bytes = std::fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let document: ProgressDocument =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    document.validate(path)?;
    Ok(document)
}

/// Write bytes to `path` via a same-directory temp file and rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(|e| StoreError::io(&parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| StoreError::io(&parent, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

impl ProgressStore for JsonFileStore {
    fn load(&self) -> Result<ProgressDocument, StoreError> {
        let document = read_document(&self.path)?;
        tracing::debug!(path = %self.path.display(), types = document.len(), "loaded progress store");
        Ok(document)
    }

    fn save(&self, document: &ProgressDocument) -> Result<(), StoreError> {
        document.validate(&self.path)?;
        let bytes = serde_json::to_vec_pretty(document)?;
        write_atomic(&self.path, &bytes)?;
        tracing::debug!(path = %self.path.display(), types = document.len(), "saved progress store");
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process store
///
/// Holds the last saved document. A save can be made to fail once, to
/// exercise infrastructure-error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<Option<ProgressDocument>>,
    /// Successful saves left before the injected failure
    fail_after: Mutex<Option<usize>>,
    save_count: Mutex<usize>,
}

impl MemoryStore {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a document
    #[must_use]
    pub fn with_document(document: ProgressDocument) -> Self {
        Self {
            document: Mutex::new(Some(document)),
            ..Self::default()
        }
    }

    /// Make the next save fail with an I/O error
    pub fn fail_next_save(&self) {
        self.fail_save_after(0);
    }

    /// Let `saves` more saves succeed, then fail one
    pub fn fail_save_after(&self, saves: usize) {
        *self.fail_after.lock() = Some(saves);
    }

    /// Number of successful saves
    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.save_count.lock()
    }
}

impl ProgressStore for MemoryStore {
    fn load(&self) -> Result<ProgressDocument, StoreError> {
        self.document.lock().clone().ok_or_else(|| {
            StoreError::io(
                "memory",
                std::io::Error::new(std::io::ErrorKind::NotFound, "no document saved"),
            )
        })
    }

    fn save(&self, document: &ProgressDocument) -> Result<(), StoreError> {
        document.validate(Path::new("memory"))?;
        {
            let mut fail_after = self.fail_after.lock();
            match *fail_after {
                Some(0) => {
                    *fail_after = None;
                    return Err(StoreError::io(
                        "memory",
                        std::io::Error::new(std::io::ErrorKind::Other, "injected save failure"),
                    ));
                }
                Some(left) => *fail_after = Some(left - 1),
                None => {}
            }
        }
        *self.document.lock() = Some(document.clone());
        *self.save_count.lock() += 1;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.document.lock().is_some()
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
