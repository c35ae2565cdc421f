//! Persistence sink: JSON snapshot of the metadata table, rewritten after every mutation.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{error, warn};

use crate::table::MetadataTable;

/// Best-effort snapshot file. The in-memory table stays authoritative; write failures are
/// logged, never returned to a command.
#[derive(Debug, Clone)]
pub struct SnapshotSink {
    path: PathBuf,
}

impl SnapshotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Table saved by a previous run. Missing or empty file: fresh table with a root entry.
    /// Unreadable or corrupt file: logged, fresh table.
    pub fn load(&self) -> MetadataTable {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return MetadataTable::with_root(),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "cannot read snapshot; starting empty"
                );
                return MetadataTable::with_root();
            }
        };
        if raw.trim().is_empty() {
            return MetadataTable::with_root();
        }
        match serde_json::from_str(&raw) {
            Ok(table) => table,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt snapshot; starting empty");
                MetadataTable::with_root()
            }
        }
    }

    /// Overwrite the snapshot with `table`. Never fails the caller.
    pub fn store(&self, table: &MetadataTable) {
        if let Err(e) = self.try_store(table) {
            error!(path = %self.path.display(), error = %e, "failed to persist metadata snapshot");
        }
    }

    fn try_store(&self, table: &MetadataTable) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(table)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Write beside the target and rename so a crash never leaves half a snapshot.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ROOT_NAME;

    #[test]
    fn missing_file_gives_root_table() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SnapshotSink::new(dir.path().join("files.json"));
        assert_eq!(sink.load(), MetadataTable::with_root());
    }

    #[test]
    fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SnapshotSink::new(dir.path().join("files.json"));
        let mut table = MetadataTable::with_root();
        table.create_entry("docs", ROOT_NAME, None);
        sink.store(&table);
        assert_eq!(sink.load(), table);
        assert!(!dir.path().join("files.json.tmp").exists());
    }

    #[test]
    fn corrupt_or_empty_file_gives_root_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files.json");
        let sink = SnapshotSink::new(&path);
        fs::write(&path, "").unwrap();
        assert_eq!(sink.load(), MetadataTable::with_root());
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(sink.load(), MetadataTable::with_root());
    }

    #[test]
    fn store_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("files.json");
        let sink = SnapshotSink::new(&path);
        sink.store(&MetadataTable::with_root());
        assert!(!path.exists());
    }
}
