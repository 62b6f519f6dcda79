//! # FarmSync Server
//!
//! Receiving side of a FarmSync node.
//!
//! This crate provides:
//! - the apply endpoint (`POST /farmsync/apply`) and a health endpoint
//! - sender authentication with HMAC-SHA256 signatures
//! - duplicate suppression and last-writer-wins reconciliation
//!
//! # Applying a batch
//!
//! For each task, in request order:
//!
//! 1. the kind must be registered, else `unknown_kind`
//! 2. its schema version must not exceed the registered one, else a
//!    versioned `unsupported_schema_version` nack
//! 3. a task at or below the origin's applied watermark for its key is
//!    acked without being applied again
//! 4. the conflict policy may skip a task superseded by another origin,
//!    judged against the node's version ledger, which local writes share
//! 5. the kind's handler applies it
//!
//! The first nack blocks the rest of the batch. The sender advances past
//! the acked prefix and retries from the nacked task.
//!
//! Watermarks live in memory and are dropped after the retention window
//! without traffic. After a restart, or once dropped, redelivered tasks are
//! applied again, which handlers tolerate because they are idempotent.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;

pub use auth::{SenderAuthenticator, SignedHeaders};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::ApplyHandler;
pub use server::{SyncServer, APPLY_ROUTE, HEALTH_ROUTE};
