//! CLI command implementations.

pub mod dump_journal;
pub mod inspect;
pub mod purge;
pub mod serve;
pub mod verify;

use farmsync_core::journal::{Journal, JournalScan};
use farmsync_core::NodeDir;
use farmsync_storage::FileBackend;
use std::path::Path;

/// Reads the journal of a data directory without taking the node lock.
pub(crate) fn scan_journal(data_dir: &Path) -> Result<JournalScan, Box<dyn std::error::Error>> {
    let path = NodeDir::journal_path_in(data_dir);
    if !path.exists() {
        return Err(format!("No journal found at {}", path.display()).into());
    }
    let backend = FileBackend::open(&path)?;
    Ok(Journal::scan(&backend)?)
}
