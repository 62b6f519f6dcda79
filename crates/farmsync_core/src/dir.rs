//! Node data directory.
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK          # Advisory lock, one process per node
//! └─ journal.log   # Durable queue journal
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.log";

/// Holds the exclusive lock on a node's data directory.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct NodeDir {
    path: PathBuf,
    _lock_file: File,
}

impl NodeDir {
    /// Opens (creating if needed) and locks a data directory.
    ///
    /// # Errors
    ///
    /// Returns `NodeLocked` if another process holds the lock.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "data path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::NodeLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the journal file.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        Self::journal_path_in(&self.path)
    }

    /// Journal path inside `data_dir`, for read-only tools that must not
    /// take the lock.
    #[must_use]
    pub fn journal_path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(JOURNAL_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let node = dir.path().join("node-a");

        let first = NodeDir::open(&node).unwrap();
        assert!(matches!(NodeDir::open(&node), Err(CoreError::NodeLocked)));
        assert_eq!(first.journal_path(), node.join("journal.log"));

        drop(first);
        assert!(NodeDir::open(&node).is_ok());
    }

    #[test]
    fn file_path_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(NodeDir::open(&file).is_err());
    }
}
