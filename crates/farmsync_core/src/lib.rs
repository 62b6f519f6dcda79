//! # FarmSync Core
//!
//! The capture side of FarmSync: everything that happens on the node where
//! a change originates, up to the point where a task sits in a target's
//! delivery queue.
//!
//! This crate provides:
//! - [`TaskRegistry`]: the sealed set of task kinds and their handlers
//! - [`ChangeCapture`]: hooks business subsystems call after a local change
//! - [`TaskLogger`]: sequence ids, fan-out and the durable journal
//! - [`optimizer`]: collapsing of redundant pending entries
//! - [`DeliveryQueue`] and [`ReviewQueue`] per [`TargetState`]
//! - [`VersionLedger`]: last known version per object, shared with the receiver
//! - built-in kinds for objects, cache invalidation and files
//!
//! Delivery itself lives in `farmsync_engine`, application on the
//! receiving node in `farmsync_server`.
//!
//! ## Example
//!
//! ```rust
//! use farmsync_core::{
//!     BuiltinHandlers, ChangeCapture, CoreConfig, DeliveryTarget, ObjectStore, TargetSet,
//!     TaskLogger, TaskRegistryBuilder,
//! };
//! use std::sync::Arc;
//!
//! let mut builder = TaskRegistryBuilder::new();
//! BuiltinHandlers::new(Arc::new(ObjectStore::new()))
//!     .register_into(&mut builder)
//!     .unwrap();
//!
//! let targets = Arc::new(
//!     TargetSet::from_config([DeliveryTarget::farm("node-2", "http://node-2:8080", "secret")], 1000)
//!         .unwrap(),
//! );
//! let logger = TaskLogger::in_memory(CoreConfig::new("node-1"), Arc::new(builder.seal()), targets.clone());
//! let capture = ChangeCapture::new(Arc::new(logger));
//!
//! capture.cache_invalidated("page:42").unwrap();
//! assert_eq!(targets.get(&"node-2".into()).unwrap().queue().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod capture;
mod clock;
mod config;
mod dir;
mod error;
mod events;
mod handlers;
pub mod journal;
mod logger;
pub mod optimizer;
mod queue;
mod registry;
mod review;
mod stats;
mod target;
mod versions;

pub use capture::{ChangeCapture, PersistenceFailurePolicy};
pub use clock::unix_millis;
pub use config::CoreConfig;
pub use dir::NodeDir;
pub use error::{CoreError, CoreResult};
pub use events::{EventFeed, SyncEvent};
pub use handlers::{
    BuiltinHandlers, CacheInvalidationHandler, FileSyncHandler, ObjectHandler, ObjectRepository,
    ObjectStore, StoredObject, CACHE_INVALIDATE, FILE_DELETE, FILE_WRITE, OBJECT_DELETE,
    OBJECT_UPSERT,
};
pub use logger::{RecoveryReport, TaskDraft, TaskLogger};
pub use queue::{DeliveryQueue, EnqueueOutcome, EntryState, QueueEntry};
pub use registry::{
    ApplyError, ApplyOutcome, OptimizationPolicy, RegisteredKind, TaskHandler, TaskKind,
    TaskRegistry, TaskRegistryBuilder,
};
pub use review::ReviewQueue;
pub use stats::{StatsSnapshot, SyncStats};
pub use target::{DeliveryTarget, StagingMode, TargetRole, TargetSet, TargetState};
pub use versions::{VersionLedger, DEFAULT_VERSION_RETENTION};
