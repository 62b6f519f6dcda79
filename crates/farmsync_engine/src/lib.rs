//! # FarmSync Engine
//!
//! Delivery side of FarmSync: drains per-target queues filled by
//! `farmsync_core` and sends them to the receivers.
//!
//! This crate provides:
//! - [`DispatchPool`]: one dispatcher task per enabled target
//! - retry with exponential backoff, unreachability and probing
//! - [`Transport`] implementations: HTTP (reqwest), loopback, mock
//! - [`StagingManager`]: id translation and dependency resolution for
//!   staging targets, and the manual approval gate
//!
//! ## Key Invariants
//!
//! - a target's queue is consumed by exactly one dispatcher
//! - only the acked prefix of a batch leaves the queue
//! - a failed head blocks its own target and nothing else
//! - entries are never dropped by delivery failures; only a purge abandons
//!   them

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dispatcher;
mod error;
mod http;
mod pool;
pub mod staging;
mod transport;

pub use config::{DispatchConfig, RetryConfig};
pub use dispatcher::{Preparation, TaskPreparer};
pub use error::{EngineError, EngineResult};
pub use http::{HttpClient, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer, ReqwestClient, APPLY_PATH};
pub use pool::DispatchPool;
pub use staging::{Dependency, DependencyResolver, StagingManager, TranslationTable};
pub use transport::{MockReply, MockTransport, Transport};
