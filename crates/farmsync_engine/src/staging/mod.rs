//! Staging synchronization.
//!
//! A staging target runs a different database, so object ids differ on
//! each side. Before a staged object is sent, its references are rewritten
//! to the ids the target assigned; missing ones are resolved by sending the
//! referenced object first.

mod manager;
mod translation;

pub use manager::{Dependency, DependencyResolver, StagingManager};
pub use translation::TranslationTable;
