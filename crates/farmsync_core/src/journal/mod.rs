//! Durable journal of critical queue entries.
//!
//! Critical tasks must survive a restart until every target acknowledged
//! them. The journal is an append-only log of queue mutations; replaying it
//! rebuilds each target's delivery and review queues.
//!
//! ## Record Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | CBOR payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery Policy
//!
//! - A truncated header or payload at the end of the file is a write that
//!   never completed; it is discarded and the file is truncated back to the
//!   last complete record.
//! - A CRC mismatch, bad magic, unknown type or future version is
//!   corruption and opening fails. No heuristic repair is attempted.
//!
//! ## Compaction
//!
//! Delivered and discarded entries leave dead records behind. Compaction
//! rewrites the journal as one `Reserve` record plus one `Enqueue`/`Hold`
//! record per live entry and swaps it in atomically.

mod iterator;
mod record;
mod recovery;
mod writer;

pub use iterator::JournalIterator;
pub use record::{compute_crc32, JournalRecord, JournalRecordType};
pub use recovery::{JournalReplay, ReplayedTarget};
pub use writer::{Journal, JournalScan};

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;
