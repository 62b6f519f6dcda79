//! Change capture.
//!
//! Business subsystems call into [`ChangeCapture`] right after their local
//! change is durable. Capture only logs and enqueues; it never waits on the
//! network.

use crate::error::{CoreError, CoreResult};
use crate::handlers::{CACHE_INVALIDATE, FILE_DELETE, FILE_WRITE, OBJECT_DELETE, OBJECT_UPSERT};
use crate::logger::{TaskDraft, TaskLogger};
use farmsync_protocol::{GroupTag, ObjectPayload, Task, TaskKindId};
use std::sync::Arc;
use tracing::error;

/// What happens to the business operation when a critical task could not
/// be journaled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistenceFailurePolicy {
    /// Return the error to the caller.
    #[default]
    FailOperation,
    /// Log the failure and let the operation succeed without replication.
    LogAndContinue,
}

/// Entry point for business subsystems.
#[derive(Clone)]
pub struct ChangeCapture {
    logger: Arc<TaskLogger>,
    policy: PersistenceFailurePolicy,
}

impl ChangeCapture {
    /// Creates a capture front end with [`PersistenceFailurePolicy::FailOperation`].
    pub fn new(logger: Arc<TaskLogger>) -> Self {
        Self {
            logger,
            policy: PersistenceFailurePolicy::default(),
        }
    }

    /// Sets the persistence failure policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PersistenceFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The logger behind this capture.
    #[must_use]
    pub fn logger(&self) -> &Arc<TaskLogger> {
        &self.logger
    }

    /// Captures a change of any registered kind.
    ///
    /// Returns `Ok(None)` when the task could not be journaled and the
    /// policy is [`PersistenceFailurePolicy::LogAndContinue`].
    ///
    /// # Errors
    ///
    /// - `UnknownKind` for an unregistered kind
    /// - `Persistence` under [`PersistenceFailurePolicy::FailOperation`]
    pub fn capture(
        &self,
        kind: impl Into<TaskKindId>,
        object_type: impl Into<String>,
        target_key: impl Into<String>,
        payload: Vec<u8>,
        groups: &[GroupTag],
    ) -> CoreResult<Option<Task>> {
        let draft = TaskDraft::new(kind, object_type, target_key, payload)
            .with_groups(groups.iter().cloned());
        match self.logger.log(draft) {
            Ok(task) => Ok(Some(task)),
            Err(e @ CoreError::Persistence { .. })
                if self.policy == PersistenceFailurePolicy::LogAndContinue =>
            {
                error!(error = %e, "change not replicated");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// An object was created or updated.
    ///
    /// # Errors
    ///
    /// See [`ChangeCapture::capture`]; payload encoding errors surface as
    /// `Protocol`.
    pub fn object_saved(
        &self,
        object_type: &str,
        key: &str,
        object: &ObjectPayload,
        groups: &[GroupTag],
    ) -> CoreResult<Option<Task>> {
        self.capture(OBJECT_UPSERT, object_type, key, object.to_bytes()?, groups)
    }

    /// An object was deleted.
    ///
    /// # Errors
    ///
    /// See [`ChangeCapture::capture`].
    pub fn object_deleted(
        &self,
        object_type: &str,
        key: &str,
        object: &ObjectPayload,
        groups: &[GroupTag],
    ) -> CoreResult<Option<Task>> {
        self.capture(OBJECT_DELETE, object_type, key, object.to_bytes()?, groups)
    }

    /// A cache key was invalidated.
    ///
    /// # Errors
    ///
    /// See [`ChangeCapture::capture`].
    pub fn cache_invalidated(&self, cache_key: &str) -> CoreResult<Option<Task>> {
        self.capture(CACHE_INVALIDATE, "cache", cache_key, Vec::new(), &[])
    }

    /// A file was written under the shared root.
    ///
    /// # Errors
    ///
    /// See [`ChangeCapture::capture`].
    pub fn file_written(&self, relative_path: &str, contents: Vec<u8>) -> CoreResult<Option<Task>> {
        self.capture(FILE_WRITE, "file", relative_path, contents, &[])
    }

    /// A file was deleted under the shared root.
    ///
    /// # Errors
    ///
    /// See [`ChangeCapture::capture`].
    pub fn file_deleted(&self, relative_path: &str) -> CoreResult<Option<Task>> {
        self.capture(FILE_DELETE, "file", relative_path, Vec::new(), &[])
    }
}
