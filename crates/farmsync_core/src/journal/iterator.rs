//! Record-by-record journal reader.

use crate::error::{CoreError, CoreResult};
use crate::journal::record::{
    compute_crc32, JournalRecord, JournalRecordType, JOURNAL_MAGIC, JOURNAL_VERSION,
};
use crate::journal::{CRC_SIZE, HEADER_SIZE};
use farmsync_storage::StorageBackend;

/// Iterates over `(offset, record)` pairs of a journal backend.
///
/// Truncated trailing records end the iteration cleanly; afterwards
/// [`JournalIterator::valid_end`] tells where the last complete record
/// ended and [`JournalIterator::torn_bytes`] how much follows it.
/// Corruption yields one `Err` and ends the iteration.
pub struct JournalIterator<'a> {
    backend: &'a dyn StorageBackend,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> JournalIterator<'a> {
    /// Creates an iterator starting at offset 0.
    pub fn new(backend: &'a dyn StorageBackend) -> CoreResult<Self> {
        Ok(Self {
            total_size: backend.size()?,
            backend,
            offset: 0,
            finished: false,
        })
    }

    /// Offset just past the last complete record read so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// Bytes after [`valid_end`](Self::valid_end).
    #[must_use]
    pub fn torn_bytes(&self) -> u64 {
        self.total_size - self.offset
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, JournalRecord)>> {
        let start = self.offset;
        let remaining = self.total_size - start;

        if remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }
        let header = self.backend.read_at(start, HEADER_SIZE)?;

        if header[0..4] != JOURNAL_MAGIC {
            return Err(CoreError::journal_corruption(format!(
                "invalid magic at offset {start}"
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > JOURNAL_VERSION {
            return Err(CoreError::journal_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }

        let type_byte = header[6];
        let record_type = JournalRecordType::from_byte(type_byte).ok_or_else(|| {
            CoreError::journal_corruption(format!(
                "unknown record type {type_byte} at offset {start}"
            ))
        })?;

        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if remaining < total_len as u64 {
            return Ok(None);
        }

        let frame = self.backend.read_at(start, total_len)?;
        let crc_start = HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes([
            frame[crc_start],
            frame[crc_start + 1],
            frame[crc_start + 2],
            frame[crc_start + 3],
        ]);
        let computed_crc = compute_crc32(&frame[..crc_start]);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let record = JournalRecord::decode_payload(record_type, &frame[HEADER_SIZE..crc_start])?;
        self.offset += total_len as u64;
        Ok(Some((start, record)))
    }
}

impl Iterator for JournalIterator<'_> {
    type Item = CoreResult<(u64, JournalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
