//! Storage backend trait.

use crate::error::StorageResult;

/// A byte store the task journal writes its records into.
///
/// # Invariants
///
/// - `append` returns the offset the data starts at
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `sync` returns, all appended bytes survive process termination
/// - `replace` swaps the entire content atomically: a crash leaves either the
///   old or the new content, never a mix
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::ReadPastEnd`] when the range is not
    /// fully inside the stored bytes.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Forces data and metadata to stable storage.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the number of stored bytes, i.e. the next append offset.
    fn size(&self) -> StorageResult<u64>;

    /// Drops every byte after `new_size`.
    ///
    /// Used to cut a torn record off the tail after a crash.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole content with `data`.
    ///
    /// Used by journal compaction.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
