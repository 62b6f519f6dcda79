//! Journal writer.

use crate::error::CoreResult;
use crate::journal::iterator::JournalIterator;
use crate::journal::record::JournalRecord;
use farmsync_storage::StorageBackend;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Result of reading a journal from the start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalScan {
    /// Complete records in write order.
    pub records: Vec<JournalRecord>,
    /// Offset just past the last complete record.
    pub valid_len: u64,
    /// Bytes of an incomplete trailing record.
    pub torn_bytes: u64,
}

/// Append-only journal over a storage backend.
///
/// Appends are serialized by an internal mutex; a batch is written with a
/// single backend append so it lands in one piece or, after a crash, as a
/// torn tail that recovery discards.
pub struct Journal {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl Journal {
    /// Opens a journal and reads its records.
    ///
    /// A torn tail is truncated away.
    ///
    /// # Errors
    ///
    /// Fails on corruption or I/O errors.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
    ) -> CoreResult<(Self, JournalScan)> {
        let scan = Self::scan(backend.as_ref())?;
        if scan.torn_bytes > 0 {
            warn!(
                valid_len = scan.valid_len,
                torn_bytes = scan.torn_bytes,
                "discarding incomplete journal record"
            );
            backend.truncate(scan.valid_len)?;
        }
        Ok((
            Self {
                backend: Mutex::new(backend),
                sync_on_write,
            },
            scan,
        ))
    }

    /// Reads every complete record without modifying the backend.
    ///
    /// # Errors
    ///
    /// Fails on corruption or I/O errors.
    pub fn scan(backend: &dyn StorageBackend) -> CoreResult<JournalScan> {
        let mut iter = JournalIterator::new(backend)?;
        let mut records = Vec::new();
        for item in iter.by_ref() {
            let (_, record) = item?;
            records.push(record);
        }
        Ok(JournalScan {
            records,
            valid_len: iter.valid_end(),
            torn_bytes: iter.torn_bytes(),
        })
    }

    /// Appends one record. Returns its offset.
    pub fn append(&self, record: &JournalRecord) -> CoreResult<u64> {
        self.append_batch(std::slice::from_ref(record))
    }

    /// Appends records as one write. Returns the offset of the first.
    pub fn append_batch(&self, records: &[JournalRecord]) -> CoreResult<u64> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&record.encode_frame()?);
        }

        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        backend.flush()?;
        if self.sync_on_write {
            backend.sync()?;
        }
        Ok(offset)
    }

    /// Rewrites the journal with the records produced by `live`.
    ///
    /// `live` runs while the journal is locked, so no append can slip in
    /// between taking the snapshot and swapping it in. Returns the number of
    /// records written.
    pub fn compact_with<F>(&self, live: F) -> CoreResult<usize>
    where
        F: FnOnce() -> Vec<JournalRecord>,
    {
        let mut backend = self.backend.lock();
        let records = live();

        let mut data = Vec::new();
        for record in &records {
            data.extend_from_slice(&record.encode_frame()?);
        }
        let before = backend.size()?;
        backend.replace(&data)?;
        debug!(
            before,
            after = data.len(),
            records = records.len(),
            "journal compacted"
        );
        Ok(records.len())
    }

    /// Current journal size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }
}
