//! # FarmSync Protocol
//!
//! Pure types shared by every node of a FarmSync deployment.
//!
//! This crate provides:
//! - [`Task`] and its identifiers, the unit of replicated change
//! - the JSON apply envelope ([`ApplyRequest`] / [`ApplyResponse`])
//! - request signing with HMAC-SHA256 ([`signing`])
//! - the staged object payload schema ([`ObjectPayload`])
//! - version stamps for last-writer-wins reconciliation
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod envelope;
mod error;
mod ids;
pub mod signing;
mod staging;
mod task;

pub use conflict::{ConflictPolicy, VersionStamp};
pub use envelope::{
    AckStatus, ApplyRequest, ApplyResponse, NackCode, NackError, TaskAck, WireTask,
    PROTOCOL_VERSION,
};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{GroupTag, SequenceId, ServerId, TaskKindId};
pub use staging::{ObjectPayload, ObjectReference};
pub use task::Task;
