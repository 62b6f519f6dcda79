//! # FarmSync Storage
//!
//! Byte backends underneath the FarmSync task journal.
//!
//! Backends are **opaque append-only stores**: the journal owns the record
//! format, framing and checksums, and a backend only knows how to append,
//! read back, make data durable and, for compaction, swap its whole content.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - tests and nodes that run without durable queues
//! - [`FileBackend`] - a single journal file using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use farmsync_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"task record").unwrap();
//! assert_eq!(backend.read_at(offset, 11).unwrap(), b"task record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
