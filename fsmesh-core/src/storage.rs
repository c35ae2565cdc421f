//! Node-local file store: version bytes under a storage root.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Reads and writes version files strictly under `root`. Paths come from peer snapshots,
/// so anything that could escape the root is refused.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(path);
        let only_normal = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !only_normal {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }

    /// Write (create or overwrite) one version file.
    pub fn write(&self, path: &str, content: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if let Some(dir) = full.parent() {
            fs::create_dir_all(dir).map_err(|e| StorageError::Io(path.to_string(), e))?;
        }
        fs::write(&full, content).map_err(|e| StorageError::Io(path.to_string(), e))
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|e| StorageError::Io(path.to_string(), e))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage path {0:?} escapes the storage root")]
    InvalidPath(String),
    #[error("storage I/O on {0:?}: {1}")]
    Io(String, #[source] io::Error),
    #[error("content digest mismatch for {0:?}")]
    DigestMismatch(String),
}
